//! End-to-end tests: captured frames through the default graph

mod common;

use common::builders::{sensor_pool, ConfigBuilder, FrameBuilder};
use common::mock_helpers::RecordingPolicyBackend;
use common::{settle_timeout, test_timeout};
use frame_coordinator::capture::{CaptureSource, SyntheticCaptureSource};
use frame_coordinator::coordinator::{MDP_NODE, OUTPUT_NODE, P2A_NODE, ROOT_NODE};
use frame_coordinator::pipeline::{NodeLifecycle, StageNode};
use frame_coordinator::scenario::{ScenarioKind, ScenarioParam};
use frame_coordinator::sensor_path::Action;
use frame_coordinator::{
    FrameCoordinator, FrameResult, LmvState, SensorId, SubmitOutcome, SwitchResult,
};
use std::sync::Arc;

fn collect(coordinator: &FrameCoordinator, count: usize) -> Vec<FrameResult> {
    let rx = coordinator.results();
    let mut results: Vec<FrameResult> = (0..count)
        .map(|_| rx.recv_timeout(settle_timeout()).unwrap())
        .collect();
    results.sort_by_key(|r| r.request_no);
    results
}

#[test]
fn test_sensor_switch_with_drain_credits() {
    let config = ConfigBuilder::new().drain_credits(2).build();
    let coordinator = FrameCoordinator::builder(config).build().unwrap();
    coordinator.start().unwrap();
    let pool = sensor_pool(16);

    for n in 0..3 {
        let outcome = coordinator
            .submit_frame(FrameBuilder::new(n).build(&pool))
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Enqueued { .. }));
    }

    let decision = coordinator.switch_sensor(SensorId::Tele);
    assert_eq!(
        decision.action,
        Action::DiscardStaleData {
            vacated: SensorId::Wide
        }
    );
    assert!(coordinator.current_state().switching);

    // Grouped frames from the vacated path do not use up credits.
    let grouped = FrameBuilder::new(3).will_follow(true).build(&pool);
    assert!(matches!(
        coordinator.submit_frame(grouped).unwrap(),
        SubmitOutcome::Enqueued { .. }
    ));
    for n in 4..6 {
        let outcome = coordinator
            .submit_frame(FrameBuilder::new(n).build(&pool))
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Enqueued { .. }));
    }
    assert_eq!(
        coordinator
            .submit_frame(FrameBuilder::new(6).build(&pool))
            .unwrap(),
        SubmitOutcome::Skipped
    );

    let tele = FrameBuilder::new(7).sensor(SensorId::Tele).build(&pool);
    assert!(matches!(
        coordinator.submit_frame(tele).unwrap(),
        SubmitOutcome::Enqueued { .. }
    ));

    let settled = coordinator.notify_switch_result(SensorId::Tele, SwitchResult::Accept);
    assert_eq!(settled.new_state, LmvState::steady(SensorId::Tele));

    let results = collect(&coordinator, 7);
    assert_eq!(
        results.iter().map(|r| r.request_no).collect::<Vec<_>>(),
        (1..=7).collect::<Vec<_>>()
    );
    let drained: Vec<u64> = results
        .iter()
        .filter(|r| r.drain)
        .map(|r| r.frame_number)
        .collect();
    assert_eq!(drained, vec![3, 4, 5]);
    assert!(results
        .iter()
        .all(|r| r.processed_by == vec![ROOT_NODE, P2A_NODE, MDP_NODE]));

    assert!(coordinator.wait_idle(settle_timeout()));
    assert_eq!(pool.available(), 16);

    let stats = coordinator.stats();
    assert_eq!(stats.accepted, 7);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.stale_discards, 1);
    assert_eq!(stats.lmv_state, "ON_TELE");
    coordinator.shutdown().unwrap();
}

#[test]
fn test_switch_during_submission_respects_drain_credits() {
    let config = ConfigBuilder::new().drain_credits(2).build();
    let coordinator = FrameCoordinator::builder(config).build().unwrap();
    coordinator.start().unwrap();
    let pool = sensor_pool(48);

    let machine = Arc::clone(coordinator.state_machine());
    let barrier = Arc::new(std::sync::Barrier::new(2));
    let switcher = {
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
            barrier.wait();
            machine.switch_to(SensorId::Tele);
        })
    };

    barrier.wait();
    let mut enqueued = 0;
    for n in 0..40 {
        if let SubmitOutcome::Enqueued { .. } = coordinator
            .submit_frame(FrameBuilder::new(n).build(&pool))
            .unwrap()
        {
            enqueued += 1;
        }
    }
    switcher.join().unwrap();

    let results = collect(&coordinator, enqueued);
    let drained: Vec<&FrameResult> = results.iter().filter(|r| r.drain).collect();
    assert!(drained.len() <= 2);
    assert!(drained.iter().all(|r| r.lmv_state.sensor == SensorId::Tele));
    // Frames admitted as active were all captured before any drained one.
    let last_active = results
        .iter()
        .filter(|r| !r.drain)
        .map(|r| r.frame_number)
        .max();
    let first_drained = drained.iter().map(|r| r.frame_number).min();
    if let (Some(active), Some(drain)) = (last_active, first_drained) {
        assert!(active < drain);
    }
    assert_eq!(
        coordinator.state_machine().drain_credits(SensorId::Wide),
        2 - drained.len() as u32
    );
    coordinator.shutdown().unwrap();
}

#[test]
fn test_rejected_switch_returns_to_previous_path() {
    let coordinator = FrameCoordinator::builder(ConfigBuilder::new().build())
        .build()
        .unwrap();
    coordinator.start().unwrap();

    coordinator.switch_sensor(SensorId::Tele);
    let t = coordinator.notify_switch_result(SensorId::Tele, SwitchResult::Reject);
    assert_eq!(t.new_state, LmvState::steady(SensorId::Wide));

    // Rejection cancels the drain window of the vacated path.
    let pool = sensor_pool(2);
    assert!(matches!(
        coordinator
            .submit_frame(FrameBuilder::new(0).sensor(SensorId::Tele).build(&pool))
            .unwrap(),
        SubmitOutcome::Skipped
    ));
    assert!(matches!(
        coordinator
            .submit_frame(FrameBuilder::new(1).build(&pool))
            .unwrap(),
        SubmitOutcome::Enqueued { .. }
    ));
}

#[test]
fn test_single_sensor_never_switches() {
    let config = ConfigBuilder::new()
        .sensors(&[SensorId::Wide], SensorId::Wide)
        .build();
    let coordinator = FrameCoordinator::builder(config).build().unwrap();
    assert!(coordinator.state_machine().is_dummy());
    coordinator.start().unwrap();

    let decision = coordinator.switch_sensor(SensorId::Tele);
    assert_eq!(decision.action, Action::DoNothing);
    assert_eq!(coordinator.current_state(), LmvState::steady(SensorId::Wide));

    let pool = sensor_pool(2);
    assert_eq!(
        coordinator
            .submit_frame(FrameBuilder::new(0).sensor(SensorId::Tele).build(&pool))
            .unwrap(),
        SubmitOutcome::Skipped
    );
    assert_eq!(coordinator.stats().stale_discards, 0);
}

#[test]
fn test_p2a_waits_for_external_holder() {
    let coordinator = FrameCoordinator::builder(ConfigBuilder::new().build())
        .build()
        .unwrap();
    coordinator.start().unwrap();
    let pool = sensor_pool(2);

    let external = coordinator.arbiter().lease().unwrap();
    coordinator
        .submit_frame(FrameBuilder::new(0).build(&pool))
        .unwrap();

    let rx = coordinator.results();
    assert!(rx.recv_timeout(test_timeout()).is_err());
    drop(external);

    let result = rx.recv_timeout(settle_timeout()).unwrap();
    assert_eq!(result.frame_number, 0);
    coordinator.shutdown().unwrap();
}

#[test]
fn test_p2a_keeps_every_frame_with_more_workers_than_clients() {
    let config = ConfigBuilder::new().workers(4).build();
    assert!(config.task_queue.max_workers > config.arbiter.max_clients);

    let coordinator = FrameCoordinator::builder(config)
        .p2a_stage(StageNode::in_place(|_, _| {
            std::thread::sleep(std::time::Duration::from_millis(30));
            Ok(())
        }))
        .build()
        .unwrap();
    coordinator.start().unwrap();
    let pool = sensor_pool(8);

    for n in 0..8 {
        coordinator
            .submit_frame(FrameBuilder::new(n).build(&pool))
            .unwrap();
    }
    let results = collect(&coordinator, 8);
    assert_eq!(
        results.iter().map(|r| r.frame_number).collect::<Vec<_>>(),
        (0..8).collect::<Vec<_>>()
    );
    assert!(coordinator.wait_idle(settle_timeout()));
    assert_eq!(coordinator.stats().rejected, 0);
    assert_eq!(coordinator.arbiter().issued_count(), 1);

    coordinator.shutdown().unwrap();
    assert_eq!(coordinator.arbiter().issued_count(), 0);
}

#[test]
fn test_custom_stage_and_startup_scenario() {
    let backend = Arc::new(RecordingPolicyBackend::new());
    let mut config = ConfigBuilder::new().build();
    config.scenario.startup = Some(ScenarioParam::new(
        ScenarioKind::NormalPreview,
        4000,
        3000,
        30,
    ));

    let coordinator = FrameCoordinator::builder(config)
        .policy_backend(backend.clone())
        .mdp_stage(StageNode::in_place(|request, _| {
            request.metadata.iso = 800;
            Ok(())
        }))
        .build()
        .unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.scenario().active().is_some());
    assert_eq!(backend.applied().len(), 1);

    let pool = sensor_pool(4);
    coordinator
        .submit_frame(FrameBuilder::new(0).build(&pool))
        .unwrap();
    let result = coordinator.results().recv_timeout(settle_timeout()).unwrap();
    // In-place stage adds no output buffer.
    assert_eq!(result.buffer_count, 1);

    coordinator.shutdown().unwrap();
    assert!(coordinator.scenario().active().is_none());
    assert_eq!(backend.applied().len(), 2);
    assert!(!coordinator.is_running());
}

#[test]
fn test_shutdown_drains_and_rejects_late_frames() {
    let coordinator = FrameCoordinator::builder(ConfigBuilder::new().workers(1).build())
        .build()
        .unwrap();
    coordinator.start().unwrap();
    let pool = sensor_pool(32);

    let mut source = SyntheticCaptureSource::new(Arc::clone(&pool), SensorId::Wide, 30)
        .with_limit(20)
        .with_group_size(4);
    while let Some(frame) = source.next_frame().unwrap() {
        coordinator.submit_frame(frame).unwrap();
    }

    coordinator.shutdown().unwrap();
    assert_eq!(coordinator.results().try_iter().count(), 20);
    assert_eq!(pool.available(), 32);

    let snapshot = coordinator.snapshot();
    assert!(snapshot
        .nodes
        .iter()
        .all(|n| n.state == NodeLifecycle::Uninitialized));
    assert!(snapshot.nodes.iter().any(|n| n.name == OUTPUT_NODE));

    assert!(coordinator
        .submit_frame(FrameBuilder::new(99).build(&pool))
        .is_err());
    assert_eq!(pool.available(), 32);

    // Idempotent
    coordinator.shutdown().unwrap();
}
