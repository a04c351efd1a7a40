//! Concurrency admission (spec §4.10, C10): a running-slot counter per
//! `pipelineConfigId`, guarding how many executions of the same pipeline
//! definition may run at once.
//!
//! The counter lives in-process and is advisory, mirroring the dispatcher's
//! advisory execution lock (C4) — the source of truth for "is this execution
//! actually running" remains the persisted [`Status`](crate::model::Status).
//! A crash-restarted process reconciles its counts from persistence before
//! trusting them; that reconciliation is the caller's responsibility, not
//! this type's.

use dashmap::DashMap;

/// Tracks running-slot usage per `pipelineConfigId` and admits or queues new
/// executions against a caller-supplied limit.
#[derive(Debug, Default)]
pub struct AdmissionController {
    running: DashMap<String, u32>,
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            running: DashMap::new(),
        }
    }

    /// Attempt to claim a running slot for `pipeline_config_id`. Returns
    /// `true` if admitted (the execution should start now), `false` if the
    /// limit is already reached (the execution should be queued as
    /// NOT_STARTED/waiting, per spec §4.10).
    pub fn try_admit(&self, pipeline_config_id: &str, max_concurrent: u32) -> bool {
        if max_concurrent == 0 {
            return true;
        }
        let mut slot = self.running.entry(pipeline_config_id.to_string()).or_insert(0);
        if *slot < max_concurrent {
            *slot += 1;
            true
        } else {
            false
        }
    }

    /// Release a previously claimed slot (called when an execution reaches a
    /// terminal status).
    pub fn release(&self, pipeline_config_id: &str) {
        if let Some(mut slot) = self.running.get_mut(pipeline_config_id) {
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn running_count(&self, pipeline_config_id: &str) -> u32 {
        self.running
            .get(pipeline_config_id)
            .map(|s| *s)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_limit_then_queues() {
        let admission = AdmissionController::new();
        assert!(admission.try_admit("pipeline-1", 2));
        assert!(admission.try_admit("pipeline-1", 2));
        assert!(!admission.try_admit("pipeline-1", 2));
        assert_eq!(admission.running_count("pipeline-1"), 2);
    }

    #[test]
    fn release_frees_a_slot_for_the_next_admission() {
        let admission = AdmissionController::new();
        assert!(admission.try_admit("pipeline-1", 1));
        assert!(!admission.try_admit("pipeline-1", 1));
        admission.release("pipeline-1");
        assert!(admission.try_admit("pipeline-1", 1));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let admission = AdmissionController::new();
        for _ in 0..10 {
            assert!(admission.try_admit("pipeline-1", 0));
        }
    }

    #[test]
    fn configs_are_tracked_independently() {
        let admission = AdmissionController::new();
        assert!(admission.try_admit("a", 1));
        assert!(admission.try_admit("b", 1));
        assert!(!admission.try_admit("a", 1));
        assert!(!admission.try_admit("b", 1));
    }
}
