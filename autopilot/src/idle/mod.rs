//! Idle Mode Processor: background maintenance that only runs while the
//! user is away.
//!
//! [`ActivityMonitor`] owns the active/idle/hibernated state.
//! [`IdleModeProcessor::tick`] runs every due task in priority order and
//! re-checks the state before each one, so activity mid-batch aborts the
//! rest of the batch at the next task boundary.

pub mod tasks;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::schedule::{ActivityState, Priority, TaskSlot, due_in_priority_order};

/// A unit of background work.
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority;
    /// Minimum time between two runs.
    fn interval(&self) -> Duration;
    fn run(&self) -> Result<()>;
}

#[derive(Debug)]
struct MonitorState {
    state: ActivityState,
    last_activity: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    inactivity_timeout: Duration,
    inner: Mutex<MonitorState>,
}

impl ActivityMonitor {
    pub fn new(inactivity_timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            inactivity_timeout,
            inner: Mutex::new(MonitorState {
                state: ActivityState::Active,
                last_activity: now,
            }),
        }
    }

    pub fn state(&self) -> ActivityState {
        self.lock().map(|s| s.state).unwrap_or(ActivityState::Hibernated)
    }

    /// User activity always returns to active.
    pub fn record_activity(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != ActivityState::Active {
            info!(from = %inner.state, "activity resumed");
        }
        inner.state = ActivityState::Active;
        inner.last_activity = now;
        Ok(())
    }

    /// External idle signal; only moves active to idle.
    pub fn signal_idle(&self) -> Result<ActivityState> {
        let mut inner = self.lock()?;
        if inner.state == ActivityState::Active {
            inner.state = ActivityState::Idle;
            info!("idle signal received");
        }
        Ok(inner.state)
    }

    /// Memory or thermal pressure; wins over every other state.
    pub fn signal_hibernate(&self) -> Result<ActivityState> {
        let mut inner = self.lock()?;
        if inner.state != ActivityState::Hibernated {
            info!(from = %inner.state, "hibernating");
        }
        inner.state = ActivityState::Hibernated;
        Ok(inner.state)
    }

    /// Move active to idle once the inactivity timeout has elapsed.
    pub fn check_timeout(&self, now: DateTime<Utc>) -> Result<ActivityState> {
        let mut inner = self.lock()?;
        let elapsed = (now - inner.last_activity).to_std().unwrap_or_default();
        if inner.state == ActivityState::Active && elapsed >= self.inactivity_timeout {
            debug!(elapsed_secs = elapsed.as_secs(), "inactivity timeout reached");
            inner.state = ActivityState::Idle;
        }
        Ok(inner.state)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MonitorState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("activity monitor lock poisoned"))
    }
}

/// What one tick did, by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks that were executed, including the ones that failed.
    pub ran: Vec<String>,
    /// Due tasks skipped because the state left idle mid-batch.
    pub aborted: Vec<String>,
    pub failed: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.ran.is_empty() && self.aborted.is_empty()
    }
}

struct Registered {
    task: Arc<dyn BackgroundTask>,
    slot: TaskSlot,
}

pub struct IdleModeProcessor {
    monitor: Arc<ActivityMonitor>,
    tasks: Mutex<Vec<Registered>>,
}

impl IdleModeProcessor {
    pub fn new(monitor: Arc<ActivityMonitor>) -> Self {
        Self {
            monitor,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn monitor(&self) -> &Arc<ActivityMonitor> {
        &self.monitor
    }

    pub fn register(&self, task: Arc<dyn BackgroundTask>) -> Result<()> {
        let slot = TaskSlot::new(task.name(), task.priority(), task.interval());
        debug!(task = %slot.name, priority = slot.priority.as_str(), "background task registered");
        self.lock()?.push(Registered { task, slot });
        Ok(())
    }

    /// Scheduling state of every registered task, in registration order.
    pub fn slots(&self) -> Result<Vec<TaskSlot>> {
        Ok(self.lock()?.iter().map(|r| r.slot.clone()).collect())
    }

    /// Run every due task while the processor stays idle.
    ///
    /// Tasks run sequentially without holding the registry lock. A failing
    /// task records its error and waits for its next interval.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        if self.monitor.check_timeout(now)? != ActivityState::Idle {
            return Ok(report);
        }

        let due: Vec<(usize, Arc<dyn BackgroundTask>)> = {
            let tasks = self.lock()?;
            let slots: Vec<TaskSlot> = tasks.iter().map(|r| r.slot.clone()).collect();
            due_in_priority_order(&slots, now)
                .into_iter()
                .map(|idx| (idx, Arc::clone(&tasks[idx].task)))
                .collect()
        };

        for (pos, (idx, task)) in due.iter().enumerate() {
            let state = self.monitor.state();
            if state != ActivityState::Idle {
                report.aborted = due[pos..].iter().map(|(_, t)| t.name().to_string()).collect();
                info!(state = %state, aborted = report.aborted.len(), "idle batch aborted");
                break;
            }
            let result = task.run();
            let name = task.name().to_string();
            let last_error = match result {
                Ok(()) => {
                    debug!(task = %name, "background task finished");
                    None
                }
                Err(err) => {
                    warn!(task = %name, err = %format!("{err:#}"), "background task failed");
                    report.failed.push(name.clone());
                    Some(format!("{err:#}"))
                }
            };
            report.ran.push(name);
            let mut tasks = self.lock()?;
            if let Some(registered) = tasks.get_mut(*idx) {
                registered.slot.last_run = Some(now);
                registered.slot.last_error = last_error;
            }
        }
        Ok(report)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Registered>>> {
        self.tasks
            .lock()
            .map_err(|_| anyhow!("idle task registry lock poisoned"))
    }
}

/// Drive [`IdleModeProcessor::tick`] on a fixed cadence until `shutdown` flips to true.
///
/// Ticks run on the blocking pool; a slow tick delays the next one rather
/// than overlapping it.
pub fn spawn_idle_loop(
    processor: Arc<IdleModeProcessor>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let processor = Arc::clone(&processor);
                    match tokio::task::spawn_blocking(move || processor.tick(Utc::now())).await {
                        Ok(Ok(report)) if !report.is_empty() => {
                            info!(
                                ran = ?report.ran,
                                aborted = ?report.aborted,
                                failed = ?report.failed,
                                "idle tick"
                            );
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => warn!(err = %err, "idle tick failed"),
                        Err(err) => warn!(err = %err, "idle tick panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("idle loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        name: &'static str,
        priority: Priority,
        fail: bool,
        runs: AtomicUsize,
        log: Arc<Mutex<Vec<String>>>,
        /// Record activity on this monitor while running.
        wakes: Option<Arc<ActivityMonitor>>,
    }

    impl Probe {
        fn new(name: &'static str, priority: Priority, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                priority,
                fail: false,
                runs: AtomicUsize::new(0),
                log: Arc::clone(log),
                wakes: None,
            }
        }
    }

    impl BackgroundTask for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> Priority {
            self.priority
        }
        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }
        fn run(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.log.lock().expect("log").push(self.name.to_string());
            if let Some(monitor) = &self.wakes {
                monitor.record_activity(Utc::now())?;
            }
            if self.fail {
                anyhow::bail!("{} exploded", self.name);
            }
            Ok(())
        }
    }

    fn idle_processor() -> (Arc<ActivityMonitor>, IdleModeProcessor) {
        let monitor = Arc::new(ActivityMonitor::new(Duration::from_secs(600), Utc::now()));
        monitor.signal_idle().expect("idle");
        (Arc::clone(&monitor), IdleModeProcessor::new(monitor))
    }

    #[test]
    fn idle_signal_only_leaves_active() {
        let monitor = ActivityMonitor::new(Duration::from_secs(600), Utc::now());
        assert_eq!(monitor.signal_hibernate().expect("hibernate"), ActivityState::Hibernated);
        assert_eq!(monitor.signal_idle().expect("idle"), ActivityState::Hibernated);
        monitor.record_activity(Utc::now()).expect("activity");
        assert_eq!(monitor.state(), ActivityState::Active);
    }

    #[test]
    fn inactivity_timeout_moves_to_idle() {
        let start = Utc::now();
        let monitor = ActivityMonitor::new(Duration::from_secs(600), start);
        let before = start + chrono::Duration::seconds(599);
        let after = start + chrono::Duration::seconds(600);
        assert_eq!(monitor.check_timeout(before).expect("check"), ActivityState::Active);
        assert_eq!(monitor.check_timeout(after).expect("check"), ActivityState::Idle);
    }

    #[test]
    fn nothing_runs_unless_idle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let monitor = Arc::new(ActivityMonitor::new(Duration::from_secs(600), Utc::now()));
        let processor = IdleModeProcessor::new(Arc::clone(&monitor));
        processor
            .register(Arc::new(Probe::new("a", Priority::High, &log)))
            .expect("register");
        assert!(processor.tick(Utc::now()).expect("tick").is_empty());
        monitor.signal_hibernate().expect("hibernate");
        assert!(processor.tick(Utc::now()).expect("tick").is_empty());
        assert!(log.lock().expect("log").is_empty());
    }

    #[test]
    fn runs_due_tasks_by_priority_and_records_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_monitor, processor) = idle_processor();
        let mut failing = Probe::new("low", Priority::Low, &log);
        failing.fail = true;
        processor.register(Arc::new(failing)).expect("register");
        processor
            .register(Arc::new(Probe::new("high", Priority::High, &log)))
            .expect("register");
        processor
            .register(Arc::new(Probe::new("medium", Priority::Medium, &log)))
            .expect("register");

        let now = Utc::now();
        let report = processor.tick(now).expect("tick");
        assert_eq!(report.ran, vec!["high", "medium", "low"]);
        assert_eq!(report.failed, vec!["low"]);
        let slots = processor.slots().expect("slots");
        assert_eq!(slots[0].last_error.as_deref(), Some("low exploded"));
        assert!(slots.iter().all(|s| s.last_run == Some(now)));

        // Not due again until the interval elapses, even for the failed task.
        assert!(processor.tick(now + chrono::Duration::seconds(30)).expect("tick").is_empty());
        let later = processor.tick(now + chrono::Duration::seconds(60)).expect("tick");
        assert_eq!(later.ran.len(), 3);
    }

    /// Activity during a task aborts the remaining tasks of the batch.
    #[test]
    fn activity_mid_batch_aborts_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (monitor, processor) = idle_processor();
        let mut waker = Probe::new("waker", Priority::High, &log);
        waker.wakes = Some(Arc::clone(&monitor));
        processor.register(Arc::new(waker)).expect("register");
        processor
            .register(Arc::new(Probe::new("second", Priority::Medium, &log)))
            .expect("register");
        processor
            .register(Arc::new(Probe::new("third", Priority::Low, &log)))
            .expect("register");

        let report = processor.tick(Utc::now()).expect("tick");
        assert_eq!(report.ran, vec!["waker"]);
        assert_eq!(report.aborted, vec!["second", "third"]);
        assert_eq!(*log.lock().expect("log"), vec!["waker"]);
        let slots = processor.slots().expect("slots");
        assert!(slots[1].last_run.is_none());
    }

    #[tokio::test]
    async fn idle_loop_ticks_until_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (_monitor, processor) = idle_processor();
        processor
            .register(Arc::new(Probe::new("a", Priority::High, &log)))
            .expect("register");
        let (tx, rx) = watch::channel(false);
        let handle = spawn_idle_loop(Arc::new(processor), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).expect("send");
        handle.await.expect("join");
        assert_eq!(*log.lock().expect("log"), vec!["a"]);
    }
}
