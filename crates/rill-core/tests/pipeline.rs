//! End-to-end pipeline behavior across operators, combinators, schedulers,
//! and recovery stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rill_core::testkit::TestSubscriber;
use rill_core::{Flow, FlowError, RetrySpec, Schedulers};

/// Routes `tracing` output through the test harness; set `RUST_LOG=debug`
/// to see operator signal taps.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn concat_emits_sources_back_to_back() {
    let probe = TestSubscriber::unbounded();
    Flow::from_iter(vec!["A", "B", "C"])
        .concat_with(Flow::from_iter(vec!["D", "E", "F"]))
        .subscribe(probe.clone());

    assert_eq!(probe.values(), vec!["A", "B", "C", "D", "E", "F"]);
    assert!(probe.is_completed());
}

#[test]
fn zip_aligns_by_index_and_stops_with_shorter() {
    let probe = TestSubscriber::unbounded();
    Flow::zip(
        Flow::from_iter(vec!["A", "B", "C"]),
        Flow::from_iter(vec!["D", "E", "F"]),
        |a, b| format!("{a}{b}"),
    )
    .subscribe(probe.clone());
    assert_eq!(probe.values(), vec!["AD", "BE", "CF"]);
    assert!(probe.is_completed());

    let probe = TestSubscriber::unbounded();
    Flow::zip(
        Flow::from_iter(vec![1, 2, 3]),
        Flow::from_iter(vec![10, 20]),
        |a, b| a * b,
    )
    .subscribe(probe.clone());
    assert_eq!(probe.values(), vec![10, 40]);
    assert!(probe.is_completed());
}

#[test]
fn merge_sequential_keeps_source_order_even_when_first_is_slower() {
    init_logging();
    let slow = Flow::from_iter(vec!["A", "B"]).delay_elements(Duration::from_millis(25));
    let fast = Flow::from_iter(vec!["C", "D"]).delay_elements(Duration::from_millis(5));

    let probe = TestSubscriber::unbounded();
    Flow::merge_sequential(vec![slow, fast]).subscribe(probe.clone());

    assert!(probe.await_terminal(Duration::from_secs(2)));
    assert_eq!(probe.values(), vec!["A", "B", "C", "D"]);
}

#[test]
fn merge_emits_in_arrival_order() {
    let slow = Flow::from_iter(vec!["A", "B"]).delay_elements(Duration::from_millis(25));
    let fast = Flow::from_iter(vec!["C", "D"]).delay_elements(Duration::from_millis(5));

    let probe = TestSubscriber::unbounded();
    Flow::merge(vec![slow, fast]).subscribe(probe.clone());

    assert!(probe.await_terminal(Duration::from_secs(2)));
    let values = probe.values();
    assert_eq!(values.len(), 4);
    assert_eq!(values[0], "C", "fast source should arrive first");
}

#[test]
fn on_error_return_caps_failed_sequence_with_default() {
    let probe = TestSubscriber::unbounded();
    Flow::from_iter(vec!["A", "B", "C"])
        .concat_with(Flow::error(FlowError::failed("boom")))
        .on_error_return("D")
        .subscribe(probe.clone());

    assert_eq!(probe.values(), vec!["A", "B", "C", "D"]);
    assert!(probe.is_completed());
    assert!(probe.error().is_none());
}

#[test]
fn retry_when_subscribes_exactly_budget_plus_one_for_matching_errors() {
    let subscriptions = Arc::new(AtomicU64::new(0));
    let count = Arc::clone(&subscriptions);
    let source = Flow::<i32>::defer(move || {
        count.fetch_add(1, Ordering::AcqRel);
        Flow::error(FlowError::failed("transient"))
    });

    let probe = TestSubscriber::unbounded();
    source
        .retry_when(RetrySpec::max_attempts(3).filter(|e| !e.is_overflow()))
        .subscribe(probe.clone());

    assert_eq!(subscriptions.load(Ordering::Acquire), 4);
    assert!(probe.error().expect("terminal error").is_retry_exhausted());
}

#[test]
fn retry_when_subscribes_exactly_once_for_excluded_errors() {
    let subscriptions = Arc::new(AtomicU64::new(0));
    let count = Arc::clone(&subscriptions);
    let source = Flow::<i32>::defer(move || {
        count.fetch_add(1, Ordering::AcqRel);
        Flow::error(FlowError::Overflow)
    });

    let probe = TestSubscriber::unbounded();
    source
        .retry_when(RetrySpec::max_attempts(3).filter(|e| !e.is_overflow()))
        .subscribe(probe.clone());

    assert_eq!(subscriptions.load(Ordering::Acquire), 1);
    assert!(probe.error().expect("terminal error").is_overflow());
}

#[test]
fn repeat_twice_triples_the_sequence() {
    let probe = TestSubscriber::unbounded();
    Flow::from_iter(vec![1, 2, 3])
        .repeat_times(2)
        .subscribe(probe.clone());

    assert_eq!(probe.values(), vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
    assert!(probe.is_completed());
}

#[test]
fn request_two_then_cancel_delivers_exactly_two() {
    let probe = TestSubscriber::with_initial_request(2);
    Flow::range(1, 100).subscribe(probe.clone());

    assert_eq!(probe.values(), vec![1, 2]);
    probe.cancel();
    probe.raw_request(50);

    assert_eq!(probe.values(), vec![1, 2]);
    assert!(!probe.is_completed());
    assert!(probe.error().is_none());
}

#[test]
fn ref_count_connects_at_threshold_and_reconnects_after_teardown() {
    let runs = Arc::new(AtomicU64::new(0));
    let r = Arc::clone(&runs);
    let source = Flow::defer(move || {
        r.fetch_add(1, Ordering::AcqRel);
        // Holds the session open until every subscriber cancels.
        Flow::from_iter(vec![1]).delay_elements(Duration::from_secs(3600))
    });
    let shared = source.publish().ref_count(2);

    let first = TestSubscriber::unbounded();
    shared.clone().subscribe(first.clone());
    assert_eq!(runs.load(Ordering::Acquire), 0, "below threshold");

    let second = TestSubscriber::unbounded();
    shared.clone().subscribe(second.clone());
    assert_eq!(runs.load(Ordering::Acquire), 1, "threshold reached");

    first.cancel();
    second.cancel();

    let third = TestSubscriber::unbounded();
    let fourth = TestSubscriber::unbounded();
    shared.clone().subscribe(third.clone());
    shared.subscribe(fourth.clone());
    assert_eq!(runs.load(Ordering::Acquire), 2, "fresh session, no replay");
    assert!(third.values().is_empty());
}

#[test]
fn full_pipeline_with_thread_hops_preserves_elements_and_order() {
    init_logging();
    let probe = TestSubscriber::unbounded();
    Flow::range(1, 50)
        .filter(|n| n % 2 == 1)
        .map(|n| n * 10)
        .log("pipeline")
        .publish_on(Schedulers::parallel())
        .subscribe(probe.clone());

    assert!(probe.await_terminal(Duration::from_secs(2)));
    let expected: Vec<i64> = (1..=50).filter(|n| n % 2 == 1).map(|n| n * 10).collect();
    assert_eq!(probe.values(), expected);
}

#[test]
fn concat_map_with_delays_yields_flat_ordered_output() {
    let probe = TestSubscriber::unbounded();
    Flow::from_iter(vec!["AB", "CD", "EF"])
        .concat_map(|s| {
            let chars: Vec<String> = s.chars().map(String::from).collect();
            Flow::from_iter(chars).delay_elements(Duration::from_millis(3))
        })
        .subscribe(probe.clone());

    assert!(probe.await_terminal(Duration::from_secs(2)));
    assert_eq!(probe.values(), vec!["A", "B", "C", "D", "E", "F"]);
}

#[test]
fn bounded_demand_is_never_exceeded_across_a_chain() {
    let probe = TestSubscriber::with_initial_request(5);
    Flow::range(1, 1000)
        .filter(|n| n % 3 == 0)
        .map(|n| n + 1)
        .subscribe(probe.clone());

    assert_eq!(probe.value_count(), 5);
    assert_eq!(probe.values(), vec![4, 7, 10, 13, 16]);
    assert!(!probe.is_completed());
}
