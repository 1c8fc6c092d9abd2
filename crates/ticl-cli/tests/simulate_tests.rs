//! End-to-end runs of the client against the loopback server

use ticl_cli::{CliConfig, Simulation, SimulationConfig};
use ticl_core::{ClientConfig, RunState};
use ticl_runtime::AppEvent;

fn fast_config() -> CliConfig {
    CliConfig {
        client: ClientConfig {
            smear_percent: 0,
            ..ClientConfig::for_test()
        },
        simulation: SimulationConfig {
            timeout_secs: 10,
            ..SimulationConfig::default()
        },
    }
}

#[tokio::test]
async fn test_simulation_acknowledges_every_invalidation() {
    let mut events = Vec::new();
    let report = Simulation::new(fast_config(), 2, 3)
        .run(|event| events.push(event.clone()))
        .await
        .unwrap();

    assert_eq!(report.invalidations_received, 3);
    assert_eq!(report.acknowledged_by_server, 3);
    assert_eq!(report.registered_on_server, 2);
    assert_eq!(report.snapshot.run_state, RunState::Started);
    assert_eq!(report.snapshot.registered_objects, 2);
    assert!(report.snapshot.client_token.is_some());

    assert_eq!(events.first(), Some(&AppEvent::Ready));
    let invalidated = events
        .iter()
        .filter(|event| matches!(event, AppEvent::Invalidate { .. }))
        .count();
    assert_eq!(invalidated, 3);
}

#[tokio::test]
async fn test_simulation_without_objects_finishes_when_ready() {
    let report = Simulation::new(fast_config(), 0, 5).run(|_| {}).await.unwrap();

    assert_eq!(report.invalidations_received, 0);
    assert_eq!(report.registered_on_server, 0);
    assert_eq!(report.snapshot.run_state, RunState::Started);
}

#[tokio::test]
async fn test_simulation_persists_token_to_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.simulation.state_dir = Some(dir.path().join("state"));

    let report = Simulation::new(config, 1, 1).run(|_| {}).await.unwrap();

    assert_eq!(report.acknowledged_by_server, 1);
    assert!(dir.path().join("state").is_dir());
}
