//! Topic naming for every message the planner exchanges.
//!
//! One queue per phase, sub-addressed by job id:
//!
//! | Message        | Topic                                   |
//! |----------------|-----------------------------------------|
//! | job intake     | `<prefix>.analysis.jobs.<job_id>`       |
//! | cancel         | `<prefix>.analysis.cancel.<job_id>`     |
//! | phase task     | `<prefix>.<phase>.tasks.<job_id>`       |
//! | phase result   | `<prefix>.<phase>.results.<job_id>`     |
//! | progress       | `<prefix>.analysis.progress.<job_id>`   |
//! | final result   | `<prefix>.analysis.results.<job_id>`    |
//!
//! The `*_pattern` methods return subscription patterns where `*` matches
//! exactly one token.

/// Default topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "rukh";

/// Topic builder bound to one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job_intake(&self, job_id: &str) -> String {
        format!("{}.analysis.jobs.{job_id}", self.prefix)
    }

    pub fn job_intake_pattern(&self) -> String {
        self.job_intake("*")
    }

    pub fn cancel(&self, job_id: &str) -> String {
        format!("{}.analysis.cancel.{job_id}", self.prefix)
    }

    pub fn cancel_pattern(&self) -> String {
        self.cancel("*")
    }

    pub fn phase_task(&self, phase: &str, job_id: &str) -> String {
        format!("{}.{phase}.tasks.{job_id}", self.prefix)
    }

    pub fn phase_task_pattern(&self, phase: &str) -> String {
        self.phase_task(phase, "*")
    }

    pub fn phase_result(&self, phase: &str, job_id: &str) -> String {
        format!("{}.{phase}.results.{job_id}", self.prefix)
    }

    pub fn phase_result_pattern(&self, phase: &str) -> String {
        self.phase_result(phase, "*")
    }

    pub fn progress(&self, job_id: &str) -> String {
        format!("{}.analysis.progress.{job_id}", self.prefix)
    }

    pub fn progress_pattern(&self) -> String {
        self.progress("*")
    }

    pub fn final_result(&self, job_id: &str) -> String {
        format!("{}.analysis.results.{job_id}", self.prefix)
    }

    pub fn final_result_pattern(&self) -> String {
        self.final_result("*")
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_topics_are_sub_addressed_by_job() {
        let topics = Topics::default();
        assert_eq!(topics.phase_task("fuzz", "job-7"), "rukh.fuzz.tasks.job-7");
        assert_eq!(
            topics.phase_result("attack_graph", "job-7"),
            "rukh.attack_graph.results.job-7"
        );
    }

    #[test]
    fn patterns_wildcard_the_job_token() {
        let topics = Topics::new("audit");
        assert_eq!(topics.job_intake_pattern(), "audit.analysis.jobs.*");
        assert_eq!(topics.phase_result_pattern("static"), "audit.static.results.*");
    }

    #[test]
    fn final_results_do_not_share_a_phase_namespace() {
        let topics = Topics::default();
        // "analysis" is not a phase name, so per-phase result patterns
        // never match the consolidated result topic.
        assert_ne!(
            topics.final_result("j"),
            topics.phase_result("static", "j")
        );
        assert!(crate::phase::Phase::from_name("analysis").is_none());
    }
}
