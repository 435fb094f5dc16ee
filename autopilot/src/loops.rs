//! Loop Detector: per-subtask trackers with per-key locking.
//!
//! Trackers live only for the lifetime of the owning task and are never
//! persisted, so loop state cannot leak between sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::core::loops::{IterationRecord, LoopAction, LoopLimits, LoopVerdict, SubtaskTracker};

const KEY_SEPARATOR: &str = "::";

/// Tracker key for a subtask owned by `task_id`.
pub fn subtask_key(task_id: &str, subtask_id: &str) -> String {
    format!("{task_id}{KEY_SEPARATOR}{subtask_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub iterations: usize,
    pub errors: usize,
    pub warned: bool,
}

type TrackerMap = HashMap<String, Arc<Mutex<SubtaskTracker>>>;

pub struct LoopDetector {
    limits: LoopLimits,
    trackers: Mutex<TrackerMap>,
}

impl LoopDetector {
    pub fn new(limits: LoopLimits) -> Self {
        Self {
            limits,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Record one tool call and return the intervention, if any.
    ///
    /// The map lock is held only to find the tracker; evaluation holds that
    /// tracker's own lock so unrelated subtasks never contend.
    pub fn record_iteration(
        &self,
        subtask_id: &str,
        tool_name: &str,
        input: &str,
        output: &str,
        error: Option<&str>,
    ) -> Result<LoopVerdict> {
        let tracker = {
            let mut map = self.lock_map()?;
            Arc::clone(map.entry(subtask_id.to_string()).or_default())
        };
        let mut tracker = tracker
            .lock()
            .map_err(|_| anyhow!("loop tracker lock poisoned for {subtask_id}"))?;
        let verdict = tracker.record(
            IterationRecord::new(tool_name, input, output, error),
            &self.limits,
        );
        match verdict.action {
            LoopAction::Continue => {}
            LoopAction::Warn => {
                info!(subtask_id, iterations = tracker.records.len(), "loop warning");
            }
            action => warn!(
                subtask_id,
                action = action.as_str(),
                iterations = tracker.records.len(),
                "loop intervention"
            ),
        }
        Ok(verdict)
    }

    pub fn stats(&self, subtask_id: &str) -> Result<Option<TrackerStats>> {
        let Some(tracker) = self.lock_map()?.get(subtask_id).cloned() else {
            return Ok(None);
        };
        let tracker = tracker
            .lock()
            .map_err(|_| anyhow!("loop tracker lock poisoned for {subtask_id}"))?;
        Ok(Some(TrackerStats {
            iterations: tracker.records.len(),
            errors: tracker.records.iter().filter(|r| r.error.is_some()).count(),
            warned: tracker.warned,
        }))
    }

    pub fn end_subtask(&self, subtask_id: &str) -> Result<()> {
        self.lock_map()?.remove(subtask_id);
        Ok(())
    }

    /// Discard the task's own tracker and every tracker keyed under it.
    pub fn end_task(&self, task_id: &str) -> Result<()> {
        let prefix = format!("{task_id}{KEY_SEPARATOR}");
        self.lock_map()?
            .retain(|key, _| key != task_id && !key.starts_with(&prefix));
        Ok(())
    }

    fn lock_map(&self) -> Result<std::sync::MutexGuard<'_, TrackerMap>> {
        self.trackers
            .lock()
            .map_err(|_| anyhow!("loop detector lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn trackers_are_independent_per_subtask() {
        let detector = LoopDetector::new(LoopLimits::default());
        for i in 0..2 {
            detector
                .record_iteration("a", "bash", &format!("{i}"), "same", None)
                .expect("record");
        }
        let other = detector
            .record_iteration("b", "bash", "x", "same", None)
            .expect("record");
        assert_eq!(other.action, LoopAction::Continue);
        let third = detector
            .record_iteration("a", "bash", "2", "same", None)
            .expect("record");
        assert_eq!(third.action, LoopAction::Escalate);
    }

    #[test]
    fn end_task_discards_owned_trackers() {
        let detector = LoopDetector::new(LoopLimits::default());
        let key = subtask_key("t1", "F1");
        detector
            .record_iteration(&key, "bash", "in", "out", Some("boom"))
            .expect("record");
        detector
            .record_iteration("t2::F1", "bash", "in", "out", None)
            .expect("record");
        let stats = detector.stats(&key).expect("stats").expect("tracker");
        assert_eq!(stats.iterations, 1);
        assert_eq!(stats.errors, 1);

        detector.end_task("t1").expect("end");
        assert!(detector.stats(&key).expect("stats").is_none());
        assert!(detector.stats("t2::F1").expect("stats").is_some());
    }

    /// Concurrent calls on one key never lose an iteration.
    #[test]
    fn concurrent_records_are_all_counted() {
        let detector = Arc::new(LoopDetector::new(LoopLimits {
            max_iterations: 1_000,
            repeat_window: 3,
        }));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let detector = Arc::clone(&detector);
                thread::spawn(move || {
                    for i in 0..25 {
                        let call = format!("{t}-{i}");
                        detector
                            .record_iteration("shared", "read", &call, &call, None)
                            .expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let stats = detector.stats("shared").expect("stats").expect("tracker");
        assert_eq!(stats.iterations, 100);
    }
}
