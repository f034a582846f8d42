//! Broker scenarios: straight lines, skips, fan-out joins, error routing.

mod common;

use common::{assert_subsequence, Scripted, TestHarness};
use serde_json::json;

const STRAIGHT_LINE: &str = r#"
name: straight_line
workflow:
  - step: start
    next: [a]
  - step: a
    call:
      kind: inline_code
      source: "print('{\"v\": 1}')"
    next: [b]
  - step: b
    call:
      kind: inline_code
      source: "print('{\"v\": 2}')"
    next: [end]
  - step: end
"#;

#[tokio::test]
async fn straight_line_runs_to_completion_in_order() {
    let harness = TestHarness::new().await;
    harness.register("tests/straight_line", STRAIGHT_LINE).await;
    let execution_id = harness.start("tests/straight_line", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "a" => Scripted::Ok(json!({"v": 1})),
            "b" => Scripted::Ok(json!({"v": 2})),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let trace = harness.event_trace(execution_id).await;
    assert_subsequence(
        &trace,
        &[
            ("execution_start", ""),
            ("step_started", "a"),
            ("action_started", "a"),
            ("action_completed", "a"),
            ("step_completed", "a"),
            ("step_started", "b"),
            ("action_started", "b"),
            ("action_completed", "b"),
            ("step_completed", "b"),
            ("execution_complete", ""),
        ],
    );

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
    assert!(execution.completed_at.is_some());
}

#[tokio::test]
async fn second_step_sees_first_steps_data() {
    let harness = TestHarness::new().await;
    harness.register("tests/data_flow", STRAIGHT_LINE).await;
    let execution_id = harness.start("tests/data_flow", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "a" => Scripted::Ok(json!({"v": 41})),
            "b" => Scripted::Ok(json!({"v": 42})),
            other => panic!("unexpected node {other}"),
        })
        .await;

    // The job for b was enqueued with a's result already bound.
    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    let b_job = jobs.iter().find(|job| job.node_id == "b").unwrap();
    assert_eq!(b_job.input_context["a"]["data"]["v"], 41);
}

#[tokio::test]
async fn false_when_skips_without_a_job() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/conditional_skip",
            r#"
name: conditional_skip
workflow:
  - step: start
    next: [a]
  - step: a
    when: "{{ workload.go == true }}"
    call:
      kind: inline_code
      source: "print(1)"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness
        .start("tests/conditional_skip", json!({"go": false}))
        .await;

    // No worker needed: the skip resolves in the first evaluation.
    let trace = harness.event_trace(execution_id).await;
    assert_subsequence(
        &trace,
        &[
            ("execution_start", ""),
            ("step_skip", "a"),
            ("execution_complete", ""),
        ],
    );
    assert!(!trace.iter().any(|(event, _)| event == "step_started"));

    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    assert!(jobs.is_empty(), "skip must not create queue jobs");

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

const DIAMOND: &str = r#"
name: diamond
workflow:
  - step: start
    next: [a, b]
  - step: a
    call: { kind: http, url: "https://upstream/a" }
    next: [c]
  - step: b
    call: { kind: http, url: "https://upstream/b" }
    next: [c]
  - step: c
    call: { kind: http, url: "https://upstream/c" }
    next: [end]
  - step: end
"#;

#[tokio::test]
async fn fan_out_joins_exactly_once() {
    let harness = TestHarness::new().await;
    harness.register("tests/diamond", DIAMOND).await;
    let execution_id = harness.start("tests/diamond", json!({})).await;

    // Both branches enqueued together by the first evaluation.
    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    let live: Vec<&str> = jobs.iter().map(|job| job.node_id.as_str()).collect();
    assert!(live.contains(&"a") && live.contains(&"b"));
    assert!(!live.contains(&"c"), "join target must wait for both branches");

    // Lease both branches, complete only a; c must stay blocked on b.
    let leased = harness.kernel.queue.lease("w1", 10, 30_000).await.unwrap();
    let a_job = leased.iter().find(|j| j.node_id == "a").unwrap();
    let b_job = leased.iter().find(|j| j.node_id == "b").unwrap();

    use server_core::storage::events::{EventDraft, EventType};
    harness
        .kernel
        .events
        .append(
            EventDraft::new(execution_id, EventType::ActionCompleted)
                .node("a")
                .result(json!({"ok": true})),
        )
        .await
        .unwrap();
    harness.kernel.queue.complete(a_job.job_id, "w1").await.unwrap();
    harness.broker.evaluate(execution_id).await.unwrap();

    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    assert!(
        !jobs.iter().any(|j| j.node_id == "c"),
        "c enqueued before b finished"
    );

    // Finish b; the join unblocks.
    harness
        .kernel
        .events
        .append(
            EventDraft::new(execution_id, EventType::ActionCompleted)
                .node("b")
                .result(json!({"ok": true})),
        )
        .await
        .unwrap();
    harness.kernel.queue.complete(b_job.job_id, "w1").await.unwrap();
    harness.broker.evaluate(execution_id).await.unwrap();

    harness
        .drive("w1", |node| match node {
            "c" => Scripted::Ok(json!({"joined": true})),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    let c_jobs: Vec<_> = jobs.iter().filter(|j| j.node_id == "c").collect();
    assert_eq!(c_jobs.len(), 1, "join step must be enqueued exactly once");

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

#[tokio::test]
async fn skipped_branch_still_discharges_a_join() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/skip_join",
            r#"
name: skip_join
workflow:
  - step: start
    next: [a, b]
  - step: a
    when: "{{ workload.run_a }}"
    call: { kind: http, url: "https://upstream/a" }
    next: [c]
  - step: b
    call: { kind: http, url: "https://upstream/b" }
    next: [c]
  - step: c
    call: { kind: http, url: "https://upstream/c" }
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness
        .start("tests/skip_join", json!({"run_a": false}))
        .await;

    harness
        .drive("w1", |node| match node {
            "b" | "c" => Scripted::Ok(json!({"ok": true})),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let trace = harness.event_trace(execution_id).await;
    assert_subsequence(
        &trace,
        &[
            ("step_skip", "a"),
            ("action_completed", "b"),
            ("step_started", "c"),
            ("execution_complete", ""),
        ],
    );
}

#[tokio::test]
async fn first_true_guard_wins_and_else_branch_catches() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/routing",
            r#"
name: routing
workflow:
  - step: start
    next: [probe]
  - step: probe
    call: { kind: http, url: "https://upstream/probe" }
    next:
      - step: hot
        when: "{{ probe.data.temp > 80 }}"
      - step: warm
        when: "{{ probe.data.temp > 60 }}"
      - step: cold
  - step: hot
    call: { kind: http, url: "https://upstream/hot" }
    next: [end]
  - step: warm
    call: { kind: http, url: "https://upstream/warm" }
    next: [end]
  - step: cold
    call: { kind: http, url: "https://upstream/cold" }
    next: [end]
  - step: end
"#,
        )
        .await;

    // temp=70: second guard matches, first does not; else is not taken.
    let execution_id = harness.start("tests/routing", json!({})).await;
    harness
        .drive("w1", |node| match node {
            "probe" => Scripted::Ok(json!({"temp": 70})),
            "warm" => Scripted::Ok(json!({})),
            other => panic!("routed to wrong branch: {other}"),
        })
        .await;
    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");

    // temp=10: no guard matches, the bare entry is the else-branch.
    let execution_id = harness.start("tests/routing", json!({})).await;
    harness
        .drive("w1", |node| match node {
            "probe" => Scripted::Ok(json!({"temp": 10})),
            "cold" => Scripted::Ok(json!({})),
            other => panic!("routed to wrong branch: {other}"),
        })
        .await;
    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

#[tokio::test]
async fn unrouted_failure_fails_the_execution_with_root_cause() {
    let harness = TestHarness::new().await;
    harness.register("tests/failing", STRAIGHT_LINE).await;
    let execution_id = harness.start("tests/failing", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "a" => Scripted::Err("upstream exploded".to_string()),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let events = harness.events(execution_id).await;
    let action_error = events
        .iter()
        .find(|e| e.event_type.as_str() == "action_error")
        .expect("action_error recorded");
    let failed = events
        .iter()
        .find(|e| e.event_type.as_str() == "execution_failed")
        .expect("execution_failed recorded");
    assert_eq!(failed.parent_event_id, Some(action_error.event_id));
    assert_eq!(failed.error.as_deref(), Some("upstream exploded"));

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "failed");
}

#[tokio::test]
async fn guarded_error_branch_recovers_a_failed_step() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/error_route",
            r#"
name: error_route
workflow:
  - step: start
    next: [flaky]
  - step: flaky
    call: { kind: http, url: "https://upstream/flaky" }
    next:
      - step: fallback
        when: "{{ flaky.error is defined }}"
      - step: end
  - step: fallback
    call: { kind: http, url: "https://upstream/fallback" }
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/error_route", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "flaky" => Scripted::Err("went sideways".to_string()),
            "fallback" => Scripted::Ok(json!({"recovered": true})),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");

    let trace = harness.event_trace(execution_id).await;
    assert_subsequence(
        &trace,
        &[
            ("action_error", "flaky"),
            ("step_started", "fallback"),
            ("execution_complete", ""),
        ],
    );
}

#[tokio::test]
async fn broken_guard_template_fails_the_execution() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/broken_guard",
            r#"
name: broken_guard
workflow:
  - step: start
    next: [a]
  - step: a
    when: "{{ workload.x ==== 1 }}"
    call: { kind: http, url: "https://upstream/a" }
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/broken_guard", json!({"x": 1})).await;

    let events = harness.events(execution_id).await;
    let failed = events
        .iter()
        .find(|e| e.event_type.as_str() == "execution_failed")
        .expect("template error escalates");
    assert!(failed.error.as_deref().unwrap_or("").contains("template"));

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "failed");
}

#[tokio::test]
async fn evaluation_is_idempotent_over_a_fixed_prefix() {
    let harness = TestHarness::new().await;
    harness.register("tests/idempotent", STRAIGHT_LINE).await;
    let execution_id = harness.start("tests/idempotent", json!({})).await;

    let events_before = harness.events(execution_id).await.len();
    let jobs_before = harness.kernel.queue.for_execution(execution_id).await.unwrap().len();

    // Replaying the broker over the same prefix changes nothing.
    for _ in 0..5 {
        harness.broker.evaluate(execution_id).await.unwrap();
    }

    assert_eq!(harness.events(execution_id).await.len(), events_before);
    assert_eq!(
        harness.kernel.queue.for_execution(execution_id).await.unwrap().len(),
        jobs_before
    );
}

#[tokio::test]
async fn event_ids_are_strictly_increasing() {
    let harness = TestHarness::new().await;
    harness.register("tests/ordering", STRAIGHT_LINE).await;
    let execution_id = harness.start("tests/ordering", json!({})).await;
    harness
        .drive("w1", |_| Scripted::Ok(json!({})))
        .await;

    let events = harness.events(execution_id).await;
    assert!(events.len() > 5);
    for pair in events.windows(2) {
        assert!(pair[0].event_id < pair[1].event_id);
    }
}
