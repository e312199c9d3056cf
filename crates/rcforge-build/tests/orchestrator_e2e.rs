//! End-to-end build scenarios against in-memory configuration and toolchain.

use std::sync::Arc;
use std::time::Duration;

use rcforge_build::fakes::{ScriptedToolchain, StaticConfigSource};
use rcforge_build::{BuildError, BuildOrchestrator, BuildRequest, ConfigError};
use rcforge_core::{
    BuildFailureKind, BuildState, Device, DeviceRegistry, Event, EventBus, EventPayload,
    ParamValue, ParameterSet, Subscription, Target, TargetId, Topic,
};

fn device(id: &str) -> Device {
    Device {
        target: Target {
            id: TargetId::new(id),
            platform: "espressif32".into(),
            board: "esp32dev".into(),
            arch: "xtensa-esp32-none-elf".into(),
        },
        product_name: format!("{id} product"),
        connections: vec![],
        parameters: ["power", "binding_phrase"]
            .into_iter()
            .map(String::from)
            .collect(),
    }
}

fn tx() -> TargetId {
    TargetId::new("TX_ESP32")
}

fn setup(toolchain: Arc<ScriptedToolchain>) -> (BuildOrchestrator, Arc<StaticConfigSource>) {
    let registry = DeviceRegistry::from_devices(vec![device("TX_ESP32")]).unwrap();
    let config = Arc::new(
        StaticConfigSource::new().with_target("TX_ESP32", ParameterSet::new().with("power", "250mW")),
    );
    let orch = BuildOrchestrator::new(Arc::new(registry), config.clone(), toolchain, EventBus::new());
    (orch, config)
}

async fn next(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(10), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription ended")
}

/// Receive events until a terminal state change arrives.
async fn until_terminal(sub: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next(sub).await;
        let done = matches!(
            &event.payload,
            EventPayload::BuildStateChanged { state, .. } if state.is_terminal()
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

fn state_of(event: &Event) -> Option<&BuildState> {
    match &event.payload {
        EventPayload::BuildStateChanged { state, .. } => Some(state),
        _ => None,
    }
}

#[tokio::test]
async fn successful_build_publishes_ordered_events() {
    let toolchain = Arc::new(ScriptedToolchain::succeeding(["compiling", "linking"], "/out/fw.bin"));
    let (orch, _) = setup(toolchain.clone());
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    let handle = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
    let events = until_terminal(&mut sub).await;
    assert_eq!(events.len(), 4);

    assert_eq!(state_of(&events[0]), Some(&BuildState::Running));
    let lines: Vec<(u64, &str)> = events[1..3]
        .iter()
        .map(|e| match &e.payload {
            EventPayload::BuildOutputLine { line, text, build_id } => {
                assert_eq!(build_id, handle.build_id());
                (*line, text.as_str())
            }
            other => panic!("expected output line, got {other:?}"),
        })
        .collect();
    assert_eq!(lines, vec![(0, "compiling"), (1, "linking")]);
    assert_eq!(
        state_of(&events[3]),
        Some(&BuildState::Succeeded {
            artifact: "/out/fw.bin".into()
        })
    );

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert_eq!(orch.state(&tx()), BuildState::Idle);

    let requests = toolchain.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].parameters.get("power"),
        Some(&ParamValue::Text("250mW".into()))
    );
}

#[tokio::test]
async fn second_submit_while_running_is_rejected() {
    let toolchain = Arc::new(ScriptedToolchain::hanging());
    let (orch, _) = setup(toolchain);
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
    let err = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap_err();
    assert!(matches!(err, BuildError::AlreadyBuilding { .. }));
    assert_eq!(orch.state(&tx()), BuildState::Running);

    orch.cancel_build(&tx()).unwrap();
    let events = until_terminal(&mut sub).await;
    let running = events
        .iter()
        .filter(|e| state_of(e) == Some(&BuildState::Running))
        .count();
    assert_eq!(running, 1);
    assert!(matches!(
        state_of(events.last().unwrap()),
        Some(BuildState::Cancelled { forced: false, .. })
    ));
}

#[tokio::test]
async fn concurrent_submits_accept_exactly_one() {
    let toolchain = Arc::new(ScriptedToolchain::hanging());
    let (orch, _) = setup(toolchain);

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.submit(BuildRequest::new("TX_ESP32")).await })
        })
        .collect();

    let mut accepted = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(BuildError::AlreadyBuilding { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(rejected, 15);
    assert_eq!(orch.running(), vec![tx()]);
}

#[tokio::test(start_paused = true)]
async fn cancel_escalates_when_soft_stop_is_ignored() {
    let grace = Duration::from_secs(3);
    let toolchain = Arc::new(ScriptedToolchain::ignoring_soft_stop(grace));
    let (orch, _) = setup(toolchain);
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    let mut handle = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
    let begun = tokio::time::Instant::now();
    orch.cancel_build(&tx()).unwrap();

    let events = until_terminal(&mut sub).await;
    match state_of(events.last().unwrap()) {
        Some(BuildState::Cancelled { forced, reason }) => {
            assert!(*forced);
            assert!(!reason.is_empty());
        }
        other => panic!("expected cancelled, got {other:?}"),
    }
    let elapsed = begun.elapsed();
    assert!(elapsed >= grace && elapsed < grace + Duration::from_millis(100));
    assert_eq!(orch.state(&tx()), BuildState::Idle);
    assert!(handle.wait().await.state.is_terminal());
    assert!(matches!(
        orch.cancel_build(&tx()),
        Err(BuildError::NotBuilding { .. })
    ));
}

#[tokio::test]
async fn configuration_failure_never_enters_running() {
    let toolchain = Arc::new(ScriptedToolchain::succeeding(["never"], "/out/fw.bin"));
    let (orch, config) = setup(toolchain.clone());
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    let request = BuildRequest::new("TX_ESP32")
        .with_overrides(ParameterSet::new().with("binding_phrase", "fly"));
    let err = orch.submit(request).await.unwrap_err();
    assert!(matches!(
        err,
        BuildError::Configuration(ConfigError::UnknownParameter(_))
    ));

    let event = next(&mut sub).await;
    match state_of(&event) {
        Some(BuildState::Failed { kind, reason }) => {
            assert_eq!(*kind, BuildFailureKind::Configuration);
            assert!(reason.contains("binding_phrase"));
        }
        other => panic!("expected failed, got {other:?}"),
    }
    assert!(sub.try_recv().is_none());
    assert!(toolchain.requests().is_empty());
    assert_eq!(config.resolve_calls(), 1);
    assert_eq!(orch.state(&tx()), BuildState::Idle);
}

#[tokio::test]
async fn toolchain_failure_reports_reason_and_allows_resubmit() {
    let toolchain = Arc::new(ScriptedToolchain::failing(["error: undefined reference"], 1));
    let (orch, _) = setup(toolchain.clone());
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    let first = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
    let events = until_terminal(&mut sub).await;
    match state_of(events.last().unwrap()) {
        Some(BuildState::Failed { kind, reason }) => {
            assert_eq!(*kind, BuildFailureKind::ToolchainExit);
            assert!(reason.contains("status 1"));
        }
        other => panic!("expected failed, got {other:?}"),
    }

    let second = orch.submit(BuildRequest::new("TX_ESP32")).await.unwrap();
    assert_ne!(first.build_id(), second.build_id());
    let events = until_terminal(&mut sub).await;
    assert_eq!(state_of(&events[0]), Some(&BuildState::Running));
    // Line numbering restarts for every build.
    assert!(matches!(
        &events[1].payload,
        EventPayload::BuildOutputLine { line: 0, .. }
    ));
    assert_eq!(toolchain.requests().len(), 2);
}

#[tokio::test]
async fn override_the_device_does_not_accept_is_rejected() {
    let toolchain = Arc::new(ScriptedToolchain::succeeding(["never"], "/out/fw.bin"));
    let registry = DeviceRegistry::from_devices(vec![Device {
        parameters: Default::default(),
        ..device("TX_ESP32")
    }])
    .unwrap();
    let config = Arc::new(
        StaticConfigSource::new().with_target("TX_ESP32", ParameterSet::new().with("power", "250mW")),
    );
    let orch = BuildOrchestrator::new(
        Arc::new(registry),
        config.clone(),
        toolchain.clone(),
        EventBus::new(),
    );
    let mut sub = orch.bus().subscribe(Topic::Build(tx()));

    let request = BuildRequest::new("TX_ESP32")
        .with_overrides(ParameterSet::new().with("power", "1000mW"));
    match orch.submit(request).await.unwrap_err() {
        BuildError::Configuration(ConfigError::NotAccepted { target, parameter }) => {
            assert_eq!(target, "TX_ESP32");
            assert_eq!(parameter, "power");
        }
        other => panic!("expected not accepted, got {other}"),
    }

    match state_of(&next(&mut sub).await) {
        Some(BuildState::Failed { kind, reason }) => {
            assert_eq!(*kind, BuildFailureKind::Configuration);
            assert!(reason.contains("power"));
        }
        other => panic!("expected failed, got {other:?}"),
    }
    assert!(sub.try_recv().is_none());
    assert_eq!(config.resolve_calls(), 0);
    assert!(toolchain.requests().is_empty());
    assert_eq!(orch.state(&tx()), BuildState::Idle);
}
