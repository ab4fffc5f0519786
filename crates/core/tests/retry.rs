//! Retry driven through the full request lifecycle.

mod common;

use std::{sync::Arc, time::Duration};

use common::{Chain, Observed, RecordingListener, MS};
use meshsim::{
    architecture::InstanceId,
    config::RetryConfig,
    network::{RequestFailedReason, RootResult},
    patterns::Retry,
    reporting::{Datapoint, StatisticsRecorder},
    DelayDistribution, Simulation, SimulationConfig,
};
use testresult::TestResult;

fn retry_config(max_tries: u32) -> RetryConfig {
    RetryConfig {
        max_tries,
        base_backoff: 10 * MS,
        max_backoff: Duration::from_secs(1),
        jitter: false,
    }
}

/// Frontend with a retry and a recorder attached, backend failing every call.
fn setup(sim: Simulation, chain: &Chain, max_tries: u32) -> (Simulation, RecordingListener, Arc<StatisticsRecorder>) {
    let stats = Arc::new(StatisticsRecorder::new());
    let mut sim = sim.with_observer(stats.clone());
    let frontend = chain.frontend_instance(&sim);
    let retry = Retry::from_config(
        frontend,
        &retry_config(max_tries),
        sim.rng().child_with_index(0),
        sim.observer(),
    );
    let recorder = RecordingListener::default();
    sim.attach_pattern(frontend, retry).expect("frontend exists");
    sim.attach_pattern(frontend, recorder.clone())
        .expect("frontend exists");
    sim.faults_mut().set_error_rate(chain.backend, 1.0);
    (sim, recorder, stats)
}

#[test_log::test]
fn test_always_failing_dependency_exhausts_retries() -> TestResult {
    let (sim, chain) = Chain::simulation(1);
    let (mut sim, recorder, stats) = setup(sim, &chain, 3);

    let root = chain.submit(&mut sim);
    sim.run_until_idle();

    assert_eq!(recorder.sends(), 3);
    assert_eq!(recorder.failures_with(RequestFailedReason::MaxRetriesReached), 1);
    assert_eq!(recorder.failures_with(RequestFailedReason::InjectedFault), 0);
    assert_eq!(sim.stats().failed_with(RequestFailedReason::InjectedFault), 3);

    // Backoff of 20ms after the first and 40ms after the second attempt.
    let delays: Vec<u64> = stats
        .select(|d| matches!(d, Datapoint::RetryDelay { .. }))
        .into_iter()
        .filter_map(|s| match s.datapoint {
            Datapoint::RetryDelay { delay_nanos, .. } => Some(delay_nanos),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![20_000_000, 40_000_000]);
    let exhausted = stats.select(|d| matches!(d, Datapoint::RetryExhausted { attempts: 3, .. }));
    assert_eq!(exhausted.len(), 1);

    let outcome = sim.outcome(root).ok_or("root has no outcome")?;
    assert_eq!(
        outcome.result,
        RootResult::Failed {
            reason: RequestFailedReason::DependencyNotAvailable
        }
    );
    assert_eq!(outcome.finished_at, 64_000_000);
    Ok(())
}

#[test_log::test]
fn test_success_on_second_attempt() -> TestResult {
    let (sim, chain) = Chain::simulation(1);
    let (mut sim, recorder, stats) = setup(sim, &chain, 3);

    let root = chain.submit(&mut sim);
    // First attempt fails at 2ms, the second is sent at 22ms.
    sim.run_until(2 * MS);
    sim.faults_mut().set_error_rate(chain.backend, 0.0);
    sim.run_until_idle();

    let attempts: Vec<_> = recorder
        .log()
        .into_iter()
        .filter_map(|o| match o {
            Observed::Send(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(recorder.log().contains(&Observed::Result(attempts[1])));
    assert_eq!(recorder.failures_with(RequestFailedReason::MaxRetriesReached), 0);

    assert!(stats
        .select(|d| matches!(d, Datapoint::RetryExhausted { .. }))
        .is_empty());
    let resolved = stats.select(|d| matches!(d, Datapoint::RetryResolved { attempts: 2, .. }));
    assert_eq!(resolved.len(), 1);

    let outcome = sim.outcome(root).ok_or("root has no outcome")?;
    assert_eq!(
        outcome.result,
        RootResult::Completed {
            response_time_nanos: 27_000_000
        }
    );
    Ok(())
}

#[test_log::test]
fn test_final_attempt_is_load_balanced() -> TestResult {
    let (arch, chain) = Chain::architecture(2);
    let sim = Simulation::new(
        arch,
        SimulationConfig {
            network_latency: DelayDistribution::fixed(MS),
            ..Default::default()
        },
    );
    let (mut sim, recorder, _) = setup(sim, &chain, 3);

    chain.submit(&mut sim);
    sim.run_until_idle();

    let handlers: Vec<Option<InstanceId>> = recorder
        .log()
        .into_iter()
        .filter_map(|o| match o {
            Observed::Send(id) => Some(id),
            _ => None,
        })
        .map(|id| sim.request(id).ok().and_then(|r| r.handler()))
        .collect();
    // Backends are instances 1 and 2; the second attempt sticks to the first
    // handler, the last one goes through the balancer again.
    assert_eq!(
        handlers,
        vec![
            Some(InstanceId::new(1)),
            Some(InstanceId::new(1)),
            Some(InstanceId::new(2))
        ]
    );
    Ok(())
}

#[test_log::test]
fn test_retry_shut_down_with_instance() -> TestResult {
    let (sim, chain) = Chain::simulation(1);
    let (mut sim, recorder, _) = setup(sim, &chain, 3);
    let frontend = chain.frontend_instance(&sim);

    let root = chain.submit(&mut sim);
    sim.run_until(2 * MS);
    // The pending retry still goes out, but later failures are not retried.
    sim.shutdown_instance(frontend)?;
    assert!(sim.hooks().is_empty());
    sim.run_until_idle();

    assert_eq!(recorder.sends(), 1);
    assert!(sim.outcome(root).is_some_and(|o| !o.is_success()));
    Ok(())
}
