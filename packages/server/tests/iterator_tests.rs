//! Iterator scenarios: sequential and async fan-out, ordering, halting.

mod common;

use common::{assert_subsequence, Scripted, TestHarness};
use serde_json::json;

const UPPER: &str = r#"
name: upper
workload:
  letters: [a, b, c, d]
workflow:
  - step: start
    next: [shout]
  - step: shout
    loop:
      collection: "{{ workload.letters }}"
      element: letter
      mode: async
      concurrency: 2
    call:
      kind: inline_code
      source: "print(ctx['letter'].upper())"
    next: [end]
  - step: end
"#;

fn upper_result(node: &str, letters: &[&str]) -> Scripted {
    let index: usize = node
        .trim_end_matches(']')
        .rsplit('[')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    Scripted::Ok(json!(letters[index].to_uppercase()))
}

#[tokio::test]
async fn async_iterator_aggregates_in_input_order() {
    let harness = TestHarness::new().await;
    harness.register("tests/upper", UPPER).await;
    let execution_id = harness.start("tests/upper", json!({})).await;

    harness
        .drive("w1", |node| upper_result(node, &["a", "b", "c", "d"]))
        .await;

    let events = harness.events(execution_id).await;
    let loop_end = events
        .iter()
        .find(|e| e.event_type.as_str() == "loop_end")
        .expect("loop_end recorded");
    assert_eq!(loop_end.result, Some(json!(["A", "B", "C", "D"])));

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

#[tokio::test]
async fn async_iterator_bounds_outstanding_children() {
    let harness = TestHarness::new().await;
    harness.register("tests/upper_bounded", UPPER).await;
    let execution_id = harness.start("tests/upper_bounded", json!({})).await;

    harness
        .drive("w1", |node| upper_result(node, &["a", "b", "c", "d"]))
        .await;

    // Replay the log: outstanding children never exceed the concurrency.
    let events = harness.events(execution_id).await;
    let mut outstanding: i64 = 0;
    for event in &events {
        match event.event_type.as_str() {
            "loop_iteration" => {
                outstanding += 1;
                assert!(
                    outstanding <= 2,
                    "more than `concurrency` children outstanding"
                );
            }
            "action_completed" | "action_error"
                if event.node_id.as_deref().is_some_and(|n| n.contains('[')) =>
            {
                outstanding -= 1;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn sequential_iterator_launches_one_at_a_time() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/seq",
            r#"
name: seq
workload:
  items: [1, 2, 3]
workflow:
  - step: start
    next: [each]
  - step: each
    loop:
      collection: "{{ workload.items }}"
      element: n
      mode: sequential
    call:
      kind: inline_code
      source: "print(ctx['n'] * 10)"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/seq", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "each[0]" => Scripted::Ok(json!(10)),
            "each[1]" => Scripted::Ok(json!(20)),
            "each[2]" => Scripted::Ok(json!(30)),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let trace = harness.event_trace(execution_id).await;
    // loop_iteration(i) strictly precedes loop_iteration(i+1), with the
    // predecessor's terminal event in between.
    assert_subsequence(
        &trace,
        &[
            ("loop_iteration", "each"),
            ("action_completed", "each[0]"),
            ("loop_iteration", "each"),
            ("action_completed", "each[1]"),
            ("loop_iteration", "each"),
            ("action_completed", "each[2]"),
            ("loop_end", "each"),
            ("execution_complete", ""),
        ],
    );

    let events = harness.events(execution_id).await;
    let loop_end = events
        .iter()
        .find(|e| e.event_type.as_str() == "loop_end")
        .unwrap();
    assert_eq!(loop_end.result, Some(json!([10, 20, 30])));
}

#[tokio::test]
async fn sequential_iterator_halts_on_first_error() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/halting",
            r#"
name: halting
workload:
  items: [1, 2, 3]
workflow:
  - step: start
    next: [each]
  - step: each
    loop:
      collection: "{{ workload.items }}"
      element: n
      mode: sequential
    call:
      kind: inline_code
      source: "print(ctx['n'])"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/halting", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "each[0]" => Scripted::Ok(json!(1)),
            "each[1]" => Scripted::Err("item two broke".to_string()),
            other => panic!("halt failed; ran {other}"),
        })
        .await;

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "failed");

    let events = harness.events(execution_id).await;
    let launched = events
        .iter()
        .filter(|e| e.event_type.as_str() == "loop_iteration")
        .count();
    assert_eq!(launched, 2, "third child must never launch");

    let failed = events
        .iter()
        .find(|e| e.event_type.as_str() == "execution_failed")
        .unwrap();
    assert_eq!(failed.error.as_deref(), Some("item two broke"));
}

#[tokio::test]
async fn continue_on_error_keeps_failed_slots_in_order() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/lenient",
            r#"
name: lenient
workload:
  items: [1, 2, 3]
workflow:
  - step: start
    next: [each]
  - step: each
    loop:
      collection: "{{ workload.items }}"
      element: n
      mode: sequential
      halt_on_error: false
    call:
      kind: inline_code
      source: "print(ctx['n'])"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/lenient", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "each[0]" => Scripted::Ok(json!(1)),
            "each[1]" => Scripted::Err("middle broke".to_string()),
            "each[2]" => Scripted::Ok(json!(3)),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let events = harness.events(execution_id).await;
    let loop_end = events
        .iter()
        .find(|e| e.event_type.as_str() == "loop_end")
        .expect("lenient loop still ends");
    assert_eq!(
        loop_end.result,
        Some(json!([1, {"error": "middle broke"}, 3]))
    );

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

#[tokio::test]
async fn where_order_by_and_limit_shape_the_fan_out() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/shaped",
            r#"
name: shaped
workload:
  cities:
    - { name: duluth, rank: 2, active: true }
    - { name: fargo, rank: 1, active: true }
    - { name: hibbing, rank: 3, active: false }
workflow:
  - step: start
    next: [each]
  - step: each
    loop:
      collection: "{{ workload.cities }}"
      element: city
      where: "{{ city.active }}"
      order_by: "{{ city.rank }}"
      limit: 2
    call:
      kind: inline_code
      source: "print(ctx['city']['name'])"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/shaped", json!({})).await;

    harness
        .drive("w1", |node| match node {
            "each[0]" => Scripted::Ok(json!("fargo")),
            "each[1]" => Scripted::Ok(json!("duluth")),
            other => panic!("unexpected node {other}"),
        })
        .await;

    let events = harness.events(execution_id).await;
    let loop_end = events
        .iter()
        .find(|e| e.event_type.as_str() == "loop_end")
        .unwrap();
    // Post-sort order: fargo (rank 1) before duluth (rank 2); hibbing
    // filtered out.
    assert_eq!(loop_end.result, Some(json!(["fargo", "duluth"])));
}

#[tokio::test]
async fn empty_collection_completes_immediately() {
    let harness = TestHarness::new().await;
    harness
        .register(
            "tests/empty_loop",
            r#"
name: empty_loop
workload:
  items: []
workflow:
  - step: start
    next: [each]
  - step: each
    loop:
      collection: "{{ workload.items }}"
      element: n
    call:
      kind: inline_code
      source: "print(ctx['n'])"
    next: [end]
  - step: end
"#,
        )
        .await;
    let execution_id = harness.start("tests/empty_loop", json!({})).await;

    // No workers involved at all.
    let events = harness.events(execution_id).await;
    let loop_end = events
        .iter()
        .find(|e| e.event_type.as_str() == "loop_end")
        .expect("empty loop ends in the first evaluation");
    assert_eq!(loop_end.result, Some(json!([])));

    let execution = harness.kernel.executions.find(execution_id).await.unwrap();
    assert_eq!(execution.status.as_str(), "completed");
}

#[tokio::test]
async fn children_render_with_loop_bindings() {
    let harness = TestHarness::new().await;
    harness.register("tests/bindings", UPPER).await;
    let execution_id = harness.start("tests/bindings", json!({})).await;

    let jobs = harness.kernel.queue.for_execution(execution_id).await.unwrap();
    let first = jobs.iter().find(|j| j.node_id == "shout[0]").unwrap();
    assert_eq!(first.input_context["letter"], "a");
    assert_eq!(first.input_context["_loop"]["index"], 0);
    assert_eq!(first.input_context["_loop"]["count"], 4);

    let payload: playbook::ResolvedAction =
        serde_json::from_slice(&first.action_spec).unwrap();
    assert!(matches!(
        payload.action,
        playbook::ActionSpec::IteratorChild { index: 0, .. }
    ));
}
