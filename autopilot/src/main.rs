//! `autopilot` command line: inspection and one-shot operations over the
//! control plane.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autopilot::core::features::validate_graph;
use autopilot::core::hashing::{hash_error_pattern, normalize_error};
use autopilot::core::plan::parse_plan;
use autopilot::core::schedule::ActivityState;
use autopilot::exit_codes;
use autopilot::features::FeatureManager;
use autopilot::harness::{BuildHarness, HarnessDeps, StopReason};
use autopilot::idle::tasks::default_tasks;
use autopilot::idle::{ActivityMonitor, IdleModeProcessor};
use autopilot::io::agent::CommandAgentRunner;
use autopilot::io::config::{AutopilotConfig, CONFIG_FILE, default_state_root, load_config};
use autopilot::io::project_state::{ProjectPaths, load_harness_context};
use autopilot::io::store::MemoryStore;
use autopilot::orchestrator::Components;
use autopilot::router::RouteTier;
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Control plane for an autonomous coding agent"
)]
struct Cli {
    /// State directory (default: $AUTOPILOT_HOME or ~/.autopilot).
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,

    /// Config file (default: <state root>/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract and validate a plan document, reporting graph errors.
    ValidatePlan { file: PathBuf },
    /// Show harness state and feature counts for a project.
    Status { project: PathBuf },
    /// Show or set a project's trust tier.
    Trust {
        project: String,
        #[arg(long)]
        set: Option<u8>,
    },
    /// Show today's spend against the caps.
    Budget,
    /// Print the normalized error-pattern hash of an error message.
    HashError { text: String },
    /// Show the routing decision for a task using heuristic triage.
    Route {
        task: String,
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
        #[arg(long)]
        offline: bool,
    },
    /// Run one idle tick with the default background tasks.
    IdleOnce,
    /// Run the build harness on a project until it completes or runs out of budget.
    Build { project: PathBuf, goal: String },
}

fn main() {
    autopilot::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let state_root = cli.state_root.unwrap_or_else(default_state_root);
    let config_path = cli.config.unwrap_or_else(|| state_root.join(CONFIG_FILE));
    let open = || open_components(&state_root, &config_path);

    match cli.command {
        Command::ValidatePlan { file } => cmd_validate_plan(&file),
        Command::Status { project } => cmd_status(&project),
        Command::HashError { text } => {
            println!("{}", hash_error_pattern(&text));
            println!("normalized: {}", normalize_error(&text));
            Ok(exit_codes::OK)
        }
        Command::Trust { project, set } => cmd_trust(&open()?.1, &project, set),
        Command::Budget => cmd_budget(&open()?.1),
        Command::Route {
            task,
            files,
            offline,
        } => cmd_route(&open()?.1, &task, &files, offline),
        Command::IdleOnce => {
            let (config, components) = open()?;
            cmd_idle_once(&components, &config)
        }
        Command::Build { project, goal } => {
            let (config, components) = open()?;
            cmd_build(&components, &config, &project, &goal)
        }
    }
}

fn open_components(state_root: &Path, config_path: &Path) -> Result<(AutopilotConfig, Components)> {
    let config = load_config(config_path)?;
    let store = Arc::new(MemoryStore::open(state_root)?);
    let components = Components::from_config(store, &config, &session_id());
    Ok((config, components))
}

fn session_id() -> String {
    format!("cli-{}", Utc::now().format("%Y%m%dT%H%M%S"))
}

fn cmd_validate_plan(file: &Path) -> Result<i32> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let plan = match parse_plan(&raw) {
        Ok(plan) => plan,
        Err(err) => {
            println!("invalid plan: {err:#}");
            return Ok(exit_codes::REJECTED);
        }
    };
    let features = plan.to_features();
    let errors = validate_graph(&features);
    if !errors.is_empty() {
        for error in &errors {
            println!("- {error}");
        }
        return Ok(exit_codes::REJECTED);
    }
    println!("plan ok: {} feature(s)", features.len());
    for feature in &features {
        let deps: Vec<&str> = feature.dependencies.iter().map(String::as_str).collect();
        println!(
            "  {} (priority {}) {}{}",
            feature.id,
            feature.priority,
            feature.description,
            if deps.is_empty() {
                String::new()
            } else {
                format!(" [after {}]", deps.join(", "))
            }
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_status(project: &Path) -> Result<i32> {
    let paths = ProjectPaths::new(project);
    match load_harness_context(&paths.harness_path)? {
        Some(context) => {
            println!("state: {}", context.state);
            println!("health: {}", context.health);
            println!("transitions: {}", context.history.len());
            if let Some(feature) = &context.current_feature {
                println!("current feature: {feature} (attempt {})", context.attempts + 1);
            }
        }
        None => println!("state: not started"),
    }
    let summary = FeatureManager::open(project)?.summary();
    println!(
        "features: {} total, {} pending, {} in progress, {} implemented, {} tested, {} blocked",
        summary.total(),
        summary.pending,
        summary.in_progress,
        summary.implemented,
        summary.tested,
        summary.blocked
    );
    Ok(exit_codes::OK)
}

fn cmd_trust(components: &Components, project: &str, set: Option<u8>) -> Result<i32> {
    if let Some(tier) = set {
        components.trust.set_tier(project, tier)?;
    }
    let status = components.trust.status(project)?;
    println!("tier: T{} ({})", status.score.tier, status.label);
    println!(
        "tasks: {} succeeded of {}, {} rollback(s), streak {}",
        status.score.successful_tasks,
        status.score.total_tasks,
        status.score.rollbacks,
        status.score.consecutive_successes
    );
    match status.successes_to_promotion {
        Some(remaining) => println!("promotion after {remaining} more consecutive success(es)"),
        None => println!("highest tier reached"),
    }
    Ok(exit_codes::OK)
}

fn cmd_budget(components: &Components) -> Result<i32> {
    let summary = components.budget.summary()?;
    let limits = components.budget.limits();
    println!(
        "today: ${:.2} spent of ${:.2} (${:.2} left, {} ledger entries)",
        summary.daily_spent_usd,
        limits.daily_cap_usd,
        summary.daily_remaining_usd,
        summary.ledger_entries_today
    );
    println!(
        "session cap: ${:.2}, turn limit per task: {}",
        limits.session_cap_usd, limits.max_turns_per_task
    );
    let admission = components.budget.enforce()?;
    println!("admission: {}", admission.reason);
    Ok(if admission.allowed {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

fn cmd_route(components: &Components, task: &str, files: &[String], offline: bool) -> Result<i32> {
    let remaining = components.budget.remaining_usd()?;
    let decision = components.router.route(task, files, remaining, offline);
    println!("tier: {}", decision.tier.as_str());
    if let Some(model) = &decision.model {
        println!("model: {model}");
    }
    println!(
        "triage: {} ({:?})",
        decision.triage.complexity, decision.triage.source
    );
    println!(
        "estimate: {} tokens, ${:.4}",
        decision.estimated_tokens, decision.estimated_cost_usd
    );
    println!("why: {}", decision.justification);
    Ok(if decision.tier == RouteTier::Unavailable {
        exit_codes::UNAVAILABLE
    } else {
        exit_codes::OK
    })
}

fn cmd_idle_once(components: &Components, config: &AutopilotConfig) -> Result<i32> {
    let now = Utc::now();
    let monitor = Arc::new(ActivityMonitor::new(
        Duration::from_secs(config.idle.inactivity_timeout_secs),
        now,
    ));
    if monitor.signal_idle()? != ActivityState::Idle {
        return Ok(exit_codes::REJECTED);
    }
    let processor = IdleModeProcessor::new(monitor);
    let tasks = default_tasks(
        &components.store,
        &components.learning,
        &config.idle,
        &config.learning,
    );
    for task in tasks {
        processor.register(task)?;
    }
    let report = processor.tick(now)?;
    println!("ran: {}", report.ran.join(", "));
    if !report.failed.is_empty() {
        println!("failed: {}", report.failed.join(", "));
        for slot in processor.slots()? {
            if let Some(err) = slot.last_error {
                println!("  {}: {err}", slot.name);
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_build(
    components: &Components,
    config: &AutopilotConfig,
    project: &Path,
    goal: &str,
) -> Result<i32> {
    let deps = HarnessDeps {
        runner: Arc::new(CommandAgentRunner::new(project, config.agent.clone())),
        budget: Arc::clone(&components.budget),
        tracer: Arc::clone(&components.tracer),
        learning: Some(Arc::clone(&components.learning)),
    };
    let mut harness =
        BuildHarness::new(project, goal, config.harness.clone(), &session_id(), deps)?;
    let outcome = harness.run()?;
    println!("final state: {}", outcome.final_state);
    for record in &outcome.history {
        match &record.feature_id {
            Some(feature) => println!("  {} -> {} ({feature})", record.from, record.to),
            None => println!("  {} -> {}", record.from, record.to),
        }
    }
    for feature in &outcome.features {
        println!("  {}: {}", feature.id, feature.status);
    }
    match outcome.stop_reason {
        StopReason::Completed => Ok(exit_codes::OK),
        StopReason::BudgetExhausted(reason) => {
            println!("stopped: {reason}");
            Ok(exit_codes::REJECTED)
        }
    }
}
