//! Self-Learning: mines execution logs for error -> fix knowledge.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::core::hashing::{hash_error_pattern, skill_pattern_hash, truncate_at_char_boundary};
use crate::core::sequence::{ErrorSequence, error_text, extract_sequences, has_error};
use crate::core::types::{ExecutionRecord, Learning, SkillCandidate};
use crate::io::config::LearningConfig;
use crate::io::store::MemoryStore;

/// Project key for heuristics that apply to every project.
pub const SHARED_PROJECT: &str = "*";

const FIX_DIFF_LIMIT: usize = 4_000;
const FIX_SUMMARY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LearningReport {
    /// Records in the log that exposed an error.
    pub errors_found: usize,
    /// Closed error sequences written as new or reinforced learnings.
    pub learnings_saved: usize,
    pub skills_flagged: usize,
}

pub struct SelfLearning {
    store: Arc<MemoryStore>,
    config: LearningConfig,
}

impl SelfLearning {
    pub fn new(store: Arc<MemoryStore>, config: LearningConfig) -> Self {
        Self { store, config }
    }

    /// Mine one task's execution log and mark the task as learned.
    pub fn learn_from_task(&self, task_id: &str) -> Result<LearningReport> {
        let records = self.store.executions(task_id)?;
        let mut report = LearningReport {
            errors_found: records.iter().filter(|r| has_error(r)).count(),
            ..LearningReport::default()
        };
        for sequence in extract_sequences(&records) {
            let occurrences = self.upsert_learning(&sequence)?;
            report.learnings_saved += 1;
            if occurrences >= self.config.skill_threshold {
                self.flag_skill(&sequence, task_id, occurrences)?;
                report.skills_flagged += 1;
            }
        }
        self.store.mark_task_learned(task_id)?;
        info!(
            task_id,
            errors_found = report.errors_found,
            learnings_saved = report.learnings_saved,
            skills_flagged = report.skills_flagged,
            "learned from task"
        );
        Ok(report)
    }

    /// Flag every learning that mentions one of the changed files by name.
    ///
    /// Returns how many learnings were newly flagged.
    pub fn mark_changed_files(&self, changed: &[String]) -> Result<usize> {
        let names: Vec<String> = changed
            .iter()
            .filter_map(|path| Path::new(path).file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(0);
        }
        self.store.update_learnings(|learnings| {
            let mut flagged = 0;
            for learning in learnings.iter_mut().filter(|l| !l.needs_revalidation) {
                let mentioned = names.iter().any(|name| {
                    learning.error_message.contains(name.as_str())
                        || learning.fix_description.contains(name.as_str())
                        || learning.fix_diff.contains(name.as_str())
                });
                if mentioned {
                    learning.needs_revalidation = true;
                    flagged += 1;
                }
            }
            debug!(flagged, "learnings flagged for revalidation");
            Ok(flagged)
        })
    }

    /// Most confident non-decayed learnings of a project and the shared heuristics,
    /// formatted for prompts.
    pub fn relevant_learnings(&self, project: &str, limit: usize) -> Result<Vec<String>> {
        let mut learnings: Vec<Learning> = self
            .store
            .learnings()?
            .into_iter()
            .filter(|l| l.project_path == project || l.project_path == SHARED_PROJECT)
            .filter(|l| !l.decayed)
            .collect();
        learnings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(learnings
            .iter()
            .take(limit)
            .map(|l| format!("{} => {}", l.error_message, l.fix_description))
            .collect())
    }

    fn upsert_learning(&self, sequence: &ErrorSequence<'_>) -> Result<u32> {
        let error_record = sequence.error_record();
        let fix_record = sequence.fix_record();
        let message = error_text(error_record);
        let pattern_hash = hash_error_pattern(&message);
        let project = project_of(sequence);
        let now = Utc::now();
        let initial_confidence = self.config.initial_confidence;

        self.store.update_learnings(|learnings| {
            if let Some(existing) = learnings
                .iter_mut()
                .find(|l| l.project_path == project && l.error_pattern_hash == pattern_hash)
            {
                existing.occurrence_count += 1;
                let count = existing.occurrence_count;
                existing.confidence = (existing.confidence + 0.1 * f64::from(count)).min(1.0);
                existing.fix_description = describe_fix(fix_record);
                existing.fix_diff = fix_diff(fix_record);
                existing.needs_revalidation = false;
                existing.decayed = false;
                existing.updated_at = now;
                debug!(pattern_hash = %pattern_hash, count, "learning reinforced");
                return Ok(count);
            }
            learnings.push(Learning {
                project_path: project.clone(),
                language: detect_language(&sequence.files_touched()).to_string(),
                error_pattern_hash: pattern_hash.clone(),
                error_message: message.clone(),
                fix_description: describe_fix(fix_record),
                fix_diff: fix_diff(fix_record),
                confidence: initial_confidence,
                occurrence_count: 1,
                needs_revalidation: false,
                decayed: false,
                created_at: now,
                updated_at: now,
            });
            debug!(pattern_hash = %pattern_hash, "learning created");
            Ok(1)
        })
    }

    fn flag_skill(
        &self,
        sequence: &ErrorSequence<'_>,
        task_id: &str,
        occurrences: u32,
    ) -> Result<()> {
        let message = error_text(sequence.error_record());
        let pattern_hash = skill_pattern_hash(&message);
        let description = format!("{message} => {}", describe_fix(sequence.fix_record()));
        let now = Utc::now();
        self.store.update_skills(|skills| {
            let candidate = skills
                .entry(pattern_hash.clone())
                .and_modify(|c| c.occurrence_count += 1)
                .or_insert_with(|| SkillCandidate {
                    pattern_hash: pattern_hash.clone(),
                    description,
                    occurrence_count: occurrences,
                    first_seen: now,
                    last_seen: now,
                    example_task_ids: Default::default(),
                    promoted: false,
                });
            candidate.last_seen = now;
            candidate.example_task_ids.insert(task_id.to_string());
            debug!(
                pattern_hash = %pattern_hash,
                count = candidate.occurrence_count,
                "skill candidate flagged"
            );
            Ok(())
        })
    }
}

fn project_of(sequence: &ErrorSequence<'_>) -> String {
    sequence
        .records
        .iter()
        .map(|r| r.project_path.as_str())
        .find(|p| !p.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn describe_fix(record: &ExecutionRecord) -> String {
    let target = if record.files_touched.is_empty() {
        let first_line = record.input.lines().next().unwrap_or_default().trim();
        truncate_at_char_boundary(first_line, FIX_SUMMARY_LIMIT).to_string()
    } else {
        record.files_touched.join(", ")
    };
    format!("{}: {target}", record.tool_name)
}

fn fix_diff(record: &ExecutionRecord) -> String {
    truncate_at_char_boundary(&record.input, FIX_DIFF_LIMIT).to_string()
}

/// Language tag from the most common known extension among `files`.
pub fn detect_language(files: &[String]) -> &'static str {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    for file in files {
        let Some(lang) = Path::new(file)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(language_for_extension)
        else {
            continue;
        };
        match counts.iter_mut().find(|(l, _)| *l == lang) {
            Some((_, n)) => *n += 1,
            None => counts.push((lang, 1)),
        }
    }
    counts
        .iter()
        .fold(None::<(&'static str, usize)>, |best, &(lang, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((lang, n)),
        })
        .map_or("unknown", |(lang, _)| lang)
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "swift" => "swift",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "sh" | "bash" => "shell",
        _ => return None,
    };
    Some(lang)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestStore, error_record, fix_record, read_record};

    fn log_task(store: &MemoryStore, task_id: &str, error: &str) {
        for record in [
            error_record(task_id, error),
            read_record(task_id, "requirements.txt"),
            fix_record(task_id, "requirements.txt"),
        ] {
            store.append_execution(&record).expect("append");
        }
    }

    fn learner(store: &TestStore) -> SelfLearning {
        SelfLearning::new(store.store(), LearningConfig::default())
    }

    #[test]
    fn one_fixed_error_yields_one_learning() {
        let store = TestStore::new();
        log_task(&store.store(), "t1", "ModuleNotFoundError: No module named 'requests'");
        let report = learner(&store).learn_from_task("t1").expect("learn");
        assert_eq!(
            report,
            LearningReport {
                errors_found: 1,
                learnings_saved: 1,
                skills_flagged: 0
            }
        );
        let learnings = store.store().learnings().expect("learnings");
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].occurrence_count, 1);
        assert!((learnings[0].confidence - 0.7).abs() < 1e-9);
        assert!(store.store().is_task_learned("t1").expect("learned"));
    }

    #[test]
    fn repeated_error_reinforces_instead_of_duplicating() {
        let store = TestStore::new();
        let learner = learner(&store);
        log_task(&store.store(), "t1", "Error at line 42 in /a/b/foo.py");
        log_task(&store.store(), "t2", "Error at line 7 in /x/y/foo.py");
        learner.learn_from_task("t1").expect("learn");
        learner.learn_from_task("t2").expect("learn");
        let learnings = store.store().learnings().expect("learnings");
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].occurrence_count, 2);
        assert!((learnings[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn third_occurrence_flags_a_skill_candidate() {
        let store = TestStore::new();
        let learner = learner(&store);
        let mut flagged = 0;
        for task in ["t1", "t2", "t3", "t4"] {
            log_task(&store.store(), task, "TypeError: 'NoneType' object is not subscriptable");
            flagged += learner.learn_from_task(task).expect("learn").skills_flagged;
        }
        assert_eq!(flagged, 2);
        let skills = store.store().skills().expect("skills");
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].occurrence_count, 4);
        assert_eq!(skills[0].example_task_ids.len(), 2);
        assert!(!skills[0].promoted);
        let learning = &store.store().learnings().expect("learnings")[0];
        assert!((learning.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unfixed_errors_teach_nothing() {
        let store = TestStore::new();
        store
            .store()
            .append_execution(&error_record("t1", "boom"))
            .expect("append");
        let report = learner(&store).learn_from_task("t1").expect("learn");
        assert_eq!(report.errors_found, 1);
        assert_eq!(report.learnings_saved, 0);
        assert!(store.store().learnings().expect("learnings").is_empty());
    }

    #[test]
    fn changed_files_flag_matching_learnings() {
        let store = TestStore::new();
        let learner = learner(&store);
        log_task(&store.store(), "t1", "cannot parse config");
        learner.learn_from_task("t1").expect("learn");
        assert_eq!(
            learner
                .mark_changed_files(&["/repo/other.txt".to_string()])
                .expect("mark"),
            0
        );
        assert_eq!(
            learner
                .mark_changed_files(&["/repo/requirements.txt".to_string()])
                .expect("mark"),
            1
        );
        assert_eq!(
            store
                .store()
                .learnings_needing_revalidation()
                .expect("learnings")
                .len(),
            1
        );
    }

    #[test]
    fn language_follows_the_majority_extension() {
        let files = vec!["a.py".to_string(), "b.py".to_string(), "c.rs".to_string()];
        assert_eq!(detect_language(&files), "python");
        assert_eq!(detect_language(&["README".to_string()]), "unknown");
    }
}
