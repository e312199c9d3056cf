//! The facade drives every component through one bus.

use std::sync::Arc;
use std::time::Duration;

use rcforge_build::fakes::{ScriptedToolchain, StaticConfigSource};
use rcforge_build::{BuildError, Toolchain};
use rcforge_core::{
    BuildState, Device, DeviceAdvert, DeviceId, DeviceRegistry, EventBus, EventPayload,
    ParameterSet, StaticSource, Subscription, Target, TargetId, Topic,
};
use rcforge_devices::{
    LoopbackDevice, LoopbackSerialTransport, SerialError, SerialParams, SimulatedDiscovery,
    SimulationScript,
};
use rcforged::Forge;

fn device(id: &str) -> Device {
    Device {
        target: Target {
            id: TargetId::new(id),
            platform: "espressif32".into(),
            board: "esp32dev".into(),
            arch: "xtensa-esp32-none-elf".into(),
        },
        product_name: format!("{id} module"),
        connections: vec![],
        parameters: ["power".to_string()].into_iter().collect(),
    }
}

fn forge(toolchain: ScriptedToolchain) -> (Forge, LoopbackDevice) {
    forge_with(Arc::new(toolchain))
}

fn forge_with(toolchain: Arc<dyn Toolchain>) -> (Forge, LoopbackDevice) {
    let bus = EventBus::new();
    let registry =
        DeviceRegistry::from_devices(vec![device("TX_ESP32"), device("RX_2400")]).unwrap();
    let config = StaticConfigSource::new()
        .with_target("TX_ESP32", ParameterSet::new().with("power", "250mW"))
        .with_target("RX_2400", ParameterSet::new());
    let script = SimulationScript::new()
        .advert(
            Duration::from_millis(100),
            DeviceAdvert {
                device_id: DeviceId::new("rx-2400-01"),
                name: "Bench RX".into(),
                address: "192.0.2.40".into(),
                target: Some(TargetId::new("RX_2400")),
                version: Some("3.4.0".into()),
            },
        )
        .until(Duration::from_secs(1));
    let discovery = SimulatedDiscovery::new(bus.clone(), script);
    let transport = LoopbackSerialTransport::new();
    let port = transport.add_port("/dev/ttyUSB0");

    let forge = Forge::new(
        bus,
        Arc::new(registry),
        Arc::new(config),
        toolchain,
        Arc::new(discovery),
        Arc::new(transport),
    );
    (forge, port)
}

async fn next_payload(sub: &mut Subscription) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(10), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription ended")
        .payload
}

#[tokio::test]
async fn lists_devices_in_target_order() {
    let (forge, _) = forge(ScriptedToolchain::succeeding(["ok"], "/out/fw.bin"));
    let ids: Vec<String> = forge
        .list_devices()
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    assert_eq!(ids, vec!["RX_2400", "TX_ESP32"]);
}

#[tokio::test]
async fn reload_replaces_the_catalog() {
    let (forge, _) = forge(ScriptedToolchain::hanging());
    let count = forge
        .reload_registry(&StaticSource::new(vec![device("TX_ESP32_LR")]))
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(forge.list_devices()[0].id(), &TargetId::new("TX_ESP32_LR"));
    assert!(matches!(
        forge.submit_build("TX_ESP32", ParameterSet::new()).await,
        Err(BuildError::UnknownTarget(_))
    ));
}

#[tokio::test]
async fn build_through_the_facade() {
    let (forge, _) = forge(
        ScriptedToolchain::succeeding(["compiling"], "/out/fw.bin")
            .with_line_delay(Duration::from_millis(50)),
    );
    let tx = TargetId::new("TX_ESP32");
    let mut sub = forge.subscribe_events(Topic::Build(tx.clone()));

    let mut handle = forge.submit_build("TX_ESP32", ParameterSet::new()).await.unwrap();
    assert!(matches!(
        forge.submit_build("TX_ESP32", ParameterSet::new()).await,
        Err(BuildError::AlreadyBuilding { .. })
    ));

    let job = handle.wait().await;
    assert_eq!(
        job.state,
        BuildState::Succeeded {
            artifact: "/out/fw.bin".into()
        }
    );
    assert!(matches!(
        next_payload(&mut sub).await,
        EventPayload::BuildStateChanged {
            state: BuildState::Running,
            ..
        }
    ));
    assert!(matches!(forge.cancel_build(&tx), Err(BuildError::NotBuilding { .. })));
}

#[tokio::test]
async fn cancel_through_the_facade() {
    let (forge, _) = forge(ScriptedToolchain::hanging());
    let rx = TargetId::new("RX_2400");
    let mut handle = forge.submit_build("RX_2400", ParameterSet::new()).await.unwrap();
    forge.cancel_build(&rx).unwrap();
    let job = handle.wait().await;
    assert!(matches!(job.state, BuildState::Cancelled { .. }));
    assert_eq!(forge.orchestrator().state(&rx), BuildState::Idle);
}

#[tokio::test(start_paused = true)]
async fn discovery_events_reach_subscribers() {
    let (forge, _) = forge(ScriptedToolchain::hanging());
    let mut sub = forge.subscribe_events(Topic::Discovery);
    forge.start().await.unwrap();

    match next_payload(&mut sub).await {
        EventPayload::DeviceDiscovered { advert } => {
            assert_eq!(advert.device_id.as_str(), "rx-2400-01")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(forge.seen_devices().len(), 1);
    forge.shutdown().await;
    assert!(sub.recv().await.is_none());
}

#[tokio::test]
async fn serial_through_the_facade() {
    let (forge, port) = forge(ScriptedToolchain::hanging());
    let rx = DeviceId::new("rx-2400-01");
    let mut params = SerialParams::new("/dev/ttyUSB0");
    params.read_timeout_ms = 10;

    assert!(matches!(
        forge.write_serial(&rx, b"status\n"),
        Err(SerialError::NotOpen(_))
    ));
    assert_eq!(forge.serial_ports().unwrap(), vec!["/dev/ttyUSB0".to_string()]);

    let mut sub = forge.subscribe_events(Topic::Serial(rx.clone()));
    forge.open_serial(&rx, &params).unwrap();
    assert!(matches!(
        forge.open_serial(&rx, &params),
        Err(SerialError::AlreadyOpen(_))
    ));

    forge.write_serial(&rx, b"status\n").unwrap();
    assert_eq!(port.written(), b"status\n");
    assert!(port.send_line("link ok"));
    match next_payload(&mut sub).await {
        EventPayload::SerialLine { device_id, text } => {
            assert_eq!(device_id, rx);
            assert_eq!(text, "link ok");
        }
        other => panic!("unexpected {other:?}"),
    }
    forge.close_serial(&rx).unwrap();
}

#[cfg(target_os = "linux")]
mod process_group {
    use super::*;
    use rcforge_build::{ProcessToolchain, ProcessToolchainSettings};

    /// Live and not a zombie.
    fn running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn shutdown_finishes_running_builds_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ProcessToolchainSettings::new("sh", dir.path());
        settings.args = vec![
            "-c".into(),
            "sleep 300 & echo $! > \"$RCFORGE_OUTPUT_DIR/sleeper.pid\"; echo started; wait".into(),
        ];
        settings.grace_period = Duration::from_millis(500);
        let (forge, _) = forge_with(Arc::new(ProcessToolchain::new(settings)));
        let forge = forge.with_shutdown_timeout(Duration::from_secs(5));

        let tx = TargetId::new("TX_ESP32");
        let mut sub = forge.subscribe_events(Topic::Build(tx.clone()));
        forge.submit_build("TX_ESP32", ParameterSet::new()).await.unwrap();
        loop {
            if let EventPayload::BuildOutputLine { text, .. } = next_payload(&mut sub).await {
                assert_eq!(text, "started");
                break;
            }
        }
        let raw = std::fs::read_to_string(dir.path().join("TX_ESP32").join("sleeper.pid")).unwrap();
        let pid: i32 = raw.trim().parse().unwrap();
        assert!(running(pid));

        forge.shutdown().await;
        assert!(forge.orchestrator().running().is_empty());
        assert!(matches!(
            forge.orchestrator().job(&tx).map(|job| job.state),
            Some(BuildState::Cancelled { .. })
        ));

        let mut last = None;
        while let Some(event) = sub.recv().await {
            last = Some(event.payload);
        }
        assert!(matches!(
            last,
            Some(EventPayload::BuildStateChanged {
                state: BuildState::Cancelled { .. },
                ..
            })
        ));

        for _ in 0..100 {
            if !running(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("forked sleeper {pid} outlived shutdown");
    }
}
