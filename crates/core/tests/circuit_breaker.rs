//! Circuit breaker driven through the full request lifecycle.

mod common;

use std::{sync::Arc, time::Duration};

use common::{Chain, Observed, RecordingListener, MS};
use meshsim::{
    config::{CircuitBreakerConfig, RetryConfig},
    network::{RequestFailedReason, RootResult},
    patterns::{CircuitBreaker, Retry},
    reporting::{Datapoint, StatisticsRecorder},
    Simulation,
};
use testresult::TestResult;

const SLEEP_WINDOW: Duration = Duration::from_millis(500);

fn setup() -> (Simulation, Chain, RecordingListener, Arc<StatisticsRecorder>) {
    let (sim, chain) = Chain::simulation(3);
    let stats = Arc::new(StatisticsRecorder::new());
    let mut sim = sim.with_observer(stats.clone());
    let frontend = chain.frontend_instance(&sim);
    let breaker = CircuitBreaker::new(
        frontend,
        CircuitBreakerConfig {
            request_volume_threshold: 3,
            error_threshold_percentage: 50.0,
            rolling_window: 10,
            sleep_window: SLEEP_WINDOW,
            timeout: None,
        },
        sim.observer(),
    );
    let recorder = RecordingListener::default();
    sim.attach_pattern(frontend, breaker).expect("frontend exists");
    sim.attach_pattern(frontend, recorder.clone())
        .expect("frontend exists");
    (sim, chain, recorder, stats)
}

/// Runs one root request to completion with the backend failing or not.
fn call(sim: &mut Simulation, chain: &Chain, fail: bool) -> RootResult {
    sim.faults_mut()
        .set_error_rate(chain.backend, if fail { 1.0 } else { 0.0 });
    let root = chain.submit(sim);
    sim.run_until_idle();
    sim.outcome(root).expect("root finished").result.clone()
}

fn is_failed(result: &RootResult) -> bool {
    matches!(result, RootResult::Failed { .. })
}

#[test_log::test]
fn test_opens_after_error_ratio_exceeded() -> TestResult {
    let (mut sim, chain, recorder, stats) = setup();

    assert!(is_failed(&call(&mut sim, &chain, true)));
    assert!(is_failed(&call(&mut sim, &chain, true)));
    assert!(!is_failed(&call(&mut sim, &chain, false)));
    // Two failures out of three calls: volume not above the threshold yet.
    assert!(stats
        .select(|d| matches!(d, Datapoint::CircuitBreaker { open: true, .. }))
        .is_empty());

    assert!(is_failed(&call(&mut sim, &chain, true)));
    let arrived = sim.stats().arrived;

    // Backend healthy again, but the breaker is open.
    let result = call(&mut sim, &chain, false);
    assert_eq!(
        result,
        RootResult::Failed {
            reason: RequestFailedReason::DependencyNotAvailable
        }
    );
    assert_eq!(recorder.failures_with(RequestFailedReason::CircuitIsOpen), 1);
    assert_eq!(sim.stats().canceled, 1);
    // Only the root reached the frontend; the canceled child never hit the
    // network.
    assert_eq!(sim.stats().arrived, arrived + 1);
    // The canceled send is not forwarded to lower priority listeners.
    assert_eq!(recorder.sends(), 4);
    Ok(())
}

#[test_log::test]
fn test_closes_after_sleep_window() -> TestResult {
    let (mut sim, chain, recorder, _) = setup();
    for fail in [true, true, false, true] {
        call(&mut sim, &chain, fail);
    }
    assert!(is_failed(&call(&mut sim, &chain, false)));

    let later = sim.now() + SLEEP_WINDOW;
    sim.run_until(later);
    let result = call(&mut sim, &chain, false);
    assert!(matches!(result, RootResult::Completed { .. }));

    let last = recorder.log().into_iter().rev().find_map(|o| match o {
        Observed::Send(id) => Some(id),
        _ => None,
    });
    let last = last.ok_or("no send observed")?;
    assert!(recorder.log().contains(&Observed::Result(last)));
    Ok(())
}

#[test_log::test]
fn test_connection_volume_limit() -> TestResult {
    let (mut sim, chain, recorder, _) = setup();
    // Four concurrent calls against a threshold of three connections.
    let roots: Vec<_> = (0..4).map(|_| chain.submit(&mut sim)).collect();
    sim.run_until_idle();

    assert_eq!(
        recorder.failures_with(RequestFailedReason::ConnectionVolumeLimitReached),
        1
    );
    let failed: Vec<_> = roots
        .iter()
        .filter(|r| sim.outcome(**r).is_some_and(|o| !o.is_success()))
        .collect();
    assert_eq!(failed, vec![&roots[3]]);
    Ok(())
}

#[test_log::test]
fn test_breaker_timeout_fails_slow_calls() -> TestResult {
    let (mut sim, chain) = Chain::simulation(3);
    let frontend = chain.frontend_instance(&sim);
    let breaker = CircuitBreaker::new(
        frontend,
        CircuitBreakerConfig {
            timeout: Some(2 * MS),
            ..Default::default()
        },
        sim.observer(),
    );
    sim.attach_pattern(frontend, breaker)?;

    // The child needs 3ms for its answer to arrive.
    let root = chain.submit(&mut sim);
    sim.run_until_idle();

    assert_eq!(sim.stats().failed_with(RequestFailedReason::Timeout), 1);
    assert_eq!(
        sim.outcome(root).map(|o| o.result.clone()),
        Some(RootResult::Failed {
            reason: RequestFailedReason::DependencyNotAvailable
        })
    );
    Ok(())
}

#[test_log::test]
fn test_breaker_behind_retry_counts_superseded_attempts() -> TestResult {
    let (sim, chain) = Chain::simulation(1);
    let stats = Arc::new(StatisticsRecorder::new());
    let mut sim = sim.with_observer(stats.clone());
    let frontend = chain.frontend_instance(&sim);
    let retry = Retry::from_config(
        frontend,
        &RetryConfig {
            max_tries: 3,
            base_backoff: 10 * MS,
            max_backoff: Duration::from_secs(1),
            jitter: false,
        },
        sim.rng().child_with_index(0),
        sim.observer(),
    );
    let breaker = CircuitBreaker::new(
        frontend,
        CircuitBreakerConfig {
            request_volume_threshold: 1,
            error_threshold_percentage: 0.0,
            rolling_window: 10,
            sleep_window: SLEEP_WINDOW,
            timeout: None,
        },
        sim.observer(),
    );
    let recorder = RecordingListener::default();
    sim.attach_pattern(frontend, breaker)?;
    sim.attach_pattern(frontend, retry)?;
    sim.attach_pattern(frontend, recorder.clone())?;
    sim.faults_mut().set_error_rate(chain.backend, 1.0);

    let root = chain.submit(&mut sim);
    sim.run_until_idle();

    // Retry consumes every injected failure, so the breaker only learns about
    // an attempt once the next one is sent. Each attempt is observed on send
    // and on arrival at the backend.
    let observed: Vec<(usize, u32, bool)> = stats
        .select(|d| matches!(d, Datapoint::CircuitBreaker { .. }))
        .into_iter()
        .filter_map(|s| match s.datapoint {
            Datapoint::CircuitBreaker {
                window_volume,
                active_connections,
                open,
                ..
            } => Some((window_volume, active_connections, open)),
            _ => None,
        })
        .collect();
    assert_eq!(
        observed,
        vec![
            (0, 1, false),
            (0, 1, false),
            (1, 1, false),
            (1, 1, false),
            (2, 0, true),
        ]
    );

    // The third attempt never left the frontend.
    assert_eq!(recorder.sends(), 2);
    assert_eq!(sim.stats().canceled, 1);
    assert_eq!(sim.stats().failed_with(RequestFailedReason::InjectedFault), 2);
    assert_eq!(recorder.failures_with(RequestFailedReason::MaxRetriesReached), 1);
    assert_eq!(recorder.failures_with(RequestFailedReason::InjectedFault), 0);
    assert_eq!(
        stats
            .select(|d| matches!(d, Datapoint::RetryExhausted { attempts: 3, .. }))
            .len(),
        1
    );
    assert_eq!(
        sim.outcome(root).map(|o| o.result.clone()),
        Some(RootResult::Failed {
            reason: RequestFailedReason::DependencyNotAvailable
        })
    );
    Ok(())
}

#[test_log::test]
fn test_arrival_at_target_is_reported() -> TestResult {
    let (mut sim, chain, _, stats) = setup();
    let root = chain.submit(&mut sim);
    sim.run_until_idle();
    assert!(sim.outcome(root).is_some_and(|o| o.is_success()));

    // Send, arrival at the backend and the result.
    let points: Vec<u64> = stats
        .select(|d| matches!(d, Datapoint::CircuitBreaker { .. }))
        .into_iter()
        .map(|s| s.at)
        .collect();
    assert_eq!(points, vec![1_000_000, 2_000_000, 4_000_000]);
    Ok(())
}
