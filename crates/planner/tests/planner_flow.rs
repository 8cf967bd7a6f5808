//! End-to-end job flows: planner, in-memory broker and simulated engines.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{fractions_of, phases_of, Harness};
use rukh_core::job::{JobStatus, PhaseOutcome};
use rukh_core::messages::{encode, ResultMessage};
use rukh_core::phase::Phase;
use rukh_planner::sim::{EngineBehavior, EngineScript};
use rukh_planner::{PlannerError, RegistryError};

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_phase_job_completes_in_order() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static", "bytecode"]).await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "bytecode", "completed"]);
    assert_eq!(fractions_of(&events), vec![0.0, 0.5, 1.0]);

    let result = h.next_result().await;
    assert_eq!(result.job_id, "job-1");
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.phases_completed, vec!["static", "bytecode"]);
    assert!(result.results.iter().all(|r| r.outcome == PhaseOutcome::Success));
    assert!(result.finished_at.is_some());

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.current_phase.is_none());

    // The second task carries the first phase's output.
    let tasks = h.tasks_for("job-1").await;
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].previous_results.len(), 1);
    assert_eq!(tasks[1].previous_results[0].phase, "static");
    assert_eq!(tasks[1].artifact.contract_name.as_deref(), Some("Vault"));

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_catalog_runs_when_no_phases_are_given() {
    let mut h = Harness::start(EngineScript::default()).await;
    let envelope = rukh_core::messages::JobEnvelope::new("job-all", common::artifact());
    h.client.submit_job(&envelope).await.unwrap();

    let events = h.progress_until_terminal().await;
    let fractions = fractions_of(&events);
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{fractions:?}");
    assert_eq!(fractions.last().copied(), Some(1.0));

    let dispatched: Vec<String> = h
        .dispatch_log("job-all")
        .await
        .into_iter()
        .map(|(phase, _)| phase)
        .collect();
    assert_eq!(dispatched, Phase::default_plan());

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Failures and timeouts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_engine_times_out_after_three_attempts() {
    let mut h = Harness::start(
        EngineScript::default().with(Phase::Fuzz, EngineBehavior::Silent),
    )
    .await;
    h.submit("job-1", &["static", "fuzz"]).await;

    let events = h.progress_until_terminal().await;
    // Re-dispatches are not transitions and emit nothing.
    assert_eq!(phases_of(&events), vec!["static", "fuzz", "failed"]);
    assert_eq!(fractions_of(&events), vec![0.0, 0.5, 0.5]);
    assert_eq!(events[2].error.as_deref(), Some("timeout after 3 attempts"));

    let result = h.next_result().await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[0].outcome, PhaseOutcome::Success);
    assert_eq!(result.results[1].outcome, PhaseOutcome::Failure);
    assert!(result.results[1]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("timeout")));
    assert_eq!(result.error.as_deref(), Some("timeout after 3 attempts"));

    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![
            ("static".to_string(), 1),
            ("fuzz".to_string(), 1),
            ("fuzz".to_string(), 2),
            ("fuzz".to_string(), 3),
        ]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn engine_failure_stops_remaining_phases() {
    let mut h = Harness::start(EngineScript::default().with(
        Phase::Bytecode,
        EngineBehavior::Fail("decompiler crashed".into()),
    ))
    .await;
    h.submit("job-1", &["static", "bytecode", "reporting"]).await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "bytecode", "failed"]);

    let result = h.next_result().await;
    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("decompiler crashed"));
    assert_eq!(result.phases_completed, vec!["static", "bytecode"]);

    // No retry for a plain engine failure, and reporting never runs.
    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![("static".to_string(), 1), ("bytecode".to_string(), 1)]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_is_redispatched() {
    let mut h = Harness::start(
        EngineScript::default().with(Phase::Static, EngineBehavior::FlakyOnce),
    )
    .await;
    h.submit("job-1", &["static"]).await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "completed"]);

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.results[0].attempts, 2);
    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![("static".to_string(), 1), ("static".to_string(), 2)]
    );

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Idempotence and stale replies
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn duplicate_result_is_ignored() {
    let mut h = Harness::start(
        EngineScript::default().with(Phase::Static, EngineBehavior::ReplyTwice),
    )
    .await;
    h.submit("job-1", &["static", "bytecode"]).await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "bytecode", "completed"]);
    let before = h.job("job-1").await;

    // Replay the static reply once more after the job has moved on.
    let task = h.tasks_for("job-1").await.remove(0);
    let reply = ResultMessage::success(&task, serde_json::json!({"findings": []}));
    let topic = h.planner.topics().phase_result("static", "job-1");
    h.channel
        .publish(&topic, encode(&reply).unwrap())
        .await
        .unwrap();

    assert!(h.try_next_progress(Duration::from_secs(60)).await.is_none());
    let after = h.job("job-1").await;
    assert_eq!(after.results, before.results);
    assert_eq!(after.updated_at, before.updated_at);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn result_for_unknown_job_is_acked_and_dropped() {
    let mut h = Harness::start(EngineScript::default()).await;

    let reply = serde_json::json!({
        "job_id": "ghost",
        "phase": "static",
        "outcome": "success",
        "payload": {}
    });
    let topic = h.planner.topics().phase_result("static", "ghost");
    h.channel
        .publish(&topic, serde_json::to_vec(&reply).unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_matches!(
        h.planner.job("ghost").await,
        Err(PlannerError::Registry(RegistryError::NotFound(_)))
    );

    // The planner keeps serving other jobs.
    h.submit("job-1", &["static"]).await;
    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "completed"]);

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Intake rules
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unknown_phase_is_recorded_as_skipped() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static", "formal_verification", "bytecode"])
        .await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "bytecode", "completed"]);

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.results.len(), 3);
    assert_eq!(job.results[1].phase, "formal_verification");
    assert_eq!(job.results[1].outcome, PhaseOutcome::Skipped);
    assert_eq!(job.results[1].payload["reason"], "unknown phase");

    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![("static".to_string(), 1), ("bytecode".to_string(), 1)]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_phase_plan_is_rejected() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static", "fuzz", "static"]).await;

    let event = h.next_progress().await;
    assert_eq!(event.phase, "failed");
    assert_eq!(event.progress, 0.0);
    assert!(event
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Duplicate phase")));

    assert_matches!(
        h.planner.job("job-1").await,
        Err(PlannerError::Registry(RegistryError::NotFound(_)))
    );
    assert!(h.engines.received().await.is_empty());

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_drops_late_results() {
    // Replies take longer than it takes to cancel.
    let mut h = Harness::start(
        EngineScript::default().with_latency(Duration::from_secs(5)),
    )
    .await;
    h.submit("job-1", &["static", "fuzz", "reporting"]).await;

    assert_eq!(h.next_progress().await.phase, "static");
    assert_eq!(h.next_progress().await.phase, "fuzz");

    h.client
        .cancel_job("job-1", Some("operator request".into()))
        .await
        .unwrap();

    let event = h.next_progress().await;
    assert_eq!(event.phase, "cancelled");
    assert_eq!(event.progress, 1.0 / 3.0);
    assert_eq!(event.error.as_deref(), Some("operator request"));

    // Let the fuzz reply and any deadline come and go.
    tokio::time::sleep(common::PHASE_TIMEOUT * 10).await;

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.results.len(), 1);
    assert!(job.finished_at.is_none());
    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![("static".to_string(), 1), ("fuzz".to_string(), 1)]
    );

    // Cancelled jobs publish no consolidated result.
    assert!(h.try_next_result(Duration::from_secs(60)).await.is_none());
    assert!(h.try_next_progress(Duration::from_secs(60)).await.is_none());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_finished_job_is_invalid() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static"]).await;
    h.progress_until_terminal().await;

    assert_matches!(
        h.planner.cancel("job-1", None).await,
        Err(PlannerError::Registry(RegistryError::InvalidTransition { .. }))
    );
    assert_eq!(h.job("job-1").await.status, JobStatus::Completed);

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Redelivery and conflicting ids
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rejected_resubmission_leaves_a_live_job_alone() {
    let mut h =
        Harness::start(EngineScript::default().with(Phase::Bytecode, EngineBehavior::Silent)).await;
    h.submit("job-1", &["static", "bytecode"]).await;
    assert_eq!(h.next_progress().await.phase, "static");
    assert_eq!(h.next_progress().await.phase, "bytecode");

    // Invalid plan and undecodable payload, both under the live id.
    h.submit("job-1", &["static", "static"]).await;
    let topic = h.planner.topics().job_intake("job-1");
    h.channel.publish(&topic, b"{not json".to_vec()).await.unwrap();

    assert!(h.try_next_progress(Duration::from_secs(5)).await.is_none());
    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.current_phase.as_deref(), Some("bytecode"));

    // A rejected intake under a fresh id is still reported.
    h.submit("job-2", &["static", "static"]).await;
    let event = h.next_progress().await;
    assert_eq!(event.job_id, "job-2");
    assert_eq!(event.phase, "failed");
    assert_eq!(event.progress, 0.0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_submission_runs_the_job_once() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static", "bytecode"]).await;
    h.submit("job-1", &["static", "bytecode"]).await;

    let events = h.progress_until_terminal().await;
    assert_eq!(phases_of(&events), vec!["static", "bytecode", "completed"]);
    assert_eq!(h.next_result().await.job_id, "job-1");
    assert!(h.try_next_result(Duration::from_secs(60)).await.is_none());
    assert_eq!(
        h.dispatch_log("job-1").await,
        vec![("static".to_string(), 1), ("bytecode".to_string(), 1)]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn conflicting_resubmission_is_dead_lettered() {
    let mut h = Harness::start(EngineScript::default()).await;
    h.submit("job-1", &["static"]).await;
    h.progress_until_terminal().await;
    h.next_result().await;

    h.submit("job-1", &["bytecode"]).await;
    // Outlast every nack delay up to the delivery ceiling.
    tokio::time::sleep(Duration::from_secs(60)).await;

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.phases, vec!["static".to_string()]);
    assert_eq!(h.dispatch_log("job-1").await, vec![("static".to_string(), 1)]);
    assert!(h.try_next_progress(Duration::from_secs(60)).await.is_none());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_that_overtakes_its_intake_applies_once_the_job_lands() {
    let mut h =
        Harness::start(EngineScript::default().with(Phase::Static, EngineBehavior::Silent)).await;

    h.client
        .cancel_job("job-1", Some("changed my mind".into()))
        .await
        .unwrap();
    // The planner nacks the cancel: no such job yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.planner.job("job-1").await.is_err());

    h.submit("job-1", &["static", "bytecode"]).await;
    assert_eq!(h.next_progress().await.phase, "static");

    let event = h.next_progress().await;
    assert_eq!(event.phase, "cancelled");
    assert_eq!(event.error.as_deref(), Some("changed my mind"));

    let job = h.job("job-1").await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(h.dispatch_log("job-1").await, vec![("static".to_string(), 1)]);

    h.shutdown().await;
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_jobs_each_run_their_phases_in_order() {
    let mut h = Harness::start(EngineScript::default()).await;
    let plan = ["static", "bytecode", "symbolic"];
    let ids: Vec<String> = (0..8).map(|i| format!("job-{i}")).collect();
    for id in &ids {
        h.submit(id, &plan).await;
    }

    let mut finished = 0;
    while finished < ids.len() {
        let result = h.next_result().await;
        assert_eq!(result.status, JobStatus::Completed, "{}", result.job_id);
        finished += 1;
    }

    for id in &ids {
        let log = h.dispatch_log(id).await;
        let expected: Vec<(String, u32)> = plan.iter().map(|p| (p.to_string(), 1)).collect();
        assert_eq!(log, expected, "{id}");

        // Each task carries exactly the results recorded before it.
        for (i, task) in h.tasks_for(id).await.iter().enumerate() {
            assert_eq!(task.previous_results.len(), i);
        }
    }

    h.shutdown().await;
}
