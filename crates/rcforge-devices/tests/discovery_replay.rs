//! Simulated discovery is deterministic and indistinguishable on the bus.

use std::time::Duration;

use rcforge_core::{DeviceAdvert, DeviceId, EventBus, TargetId, Topic};
use rcforge_devices::{Discovery, SimulatedDiscovery, SimulationScript};

fn advert(id: &str, version: &str) -> DeviceAdvert {
    DeviceAdvert {
        device_id: DeviceId::new(id),
        name: format!("{id} module"),
        address: "198.51.100.4".into(),
        target: Some(TargetId::new("RX_2400")),
        version: Some(version.into()),
    }
}

fn script() -> SimulationScript {
    SimulationScript::new()
        .advert(Duration::from_millis(0), advert("rx-a", "3.4.0"))
        .advert(Duration::from_millis(500), advert("rx-b", "3.4.0"))
        .advert(Duration::from_millis(1500), advert("rx-a", "3.4.0"))
        .advert(Duration::from_millis(2500), advert("rx-a", "3.5.0"))
        .until(Duration::from_secs(10))
}

#[test]
fn replay_is_identical_across_runs() {
    let first = SimulatedDiscovery::new(EventBus::new(), script())
        .with_timeout(Duration::from_secs(2))
        .replay();
    let second = SimulatedDiscovery::new(EventBus::new(), script())
        .with_timeout(Duration::from_secs(2))
        .replay();
    assert_eq!(first, second);

    let kinds: Vec<&str> = first.iter().map(|p| p.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            "device_discovered", // rx-a
            "device_discovered", // rx-b
            "device_lost",       // rx-b at 2.5s
            "device_discovered", // rx-a changed version
            "device_lost",       // rx-a at 4.5s
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn published_sequence_matches_replay() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe(Topic::Discovery);
    let discovery =
        SimulatedDiscovery::new(bus.clone(), script()).with_timeout(Duration::from_secs(2));
    let expected = discovery.replay();

    discovery.start().await.unwrap();
    let mut published = Vec::new();
    let mut seqs = Vec::new();
    for _ in 0..expected.len() {
        let event = sub.recv().await.expect("subscription ended");
        seqs.push(event.seq);
        published.push(event.payload);
    }
    assert_eq!(published, expected);
    assert_eq!(seqs, (0..expected.len() as u64).collect::<Vec<_>>());
    assert!(discovery.seen().is_empty());
    discovery.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_devices_seen_so_far() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe(Topic::Discovery);
    let discovery =
        SimulatedDiscovery::new(bus.clone(), script()).with_timeout(Duration::from_secs(2));
    discovery.start().await.unwrap();

    for _ in 0..2 {
        sub.recv().await.expect("subscription ended");
    }
    discovery.stop().await;

    let ids: Vec<String> = discovery
        .seen()
        .into_iter()
        .map(|a| a.device_id.to_string())
        .collect();
    assert_eq!(ids, vec!["rx-a", "rx-b"]);
    assert!(sub.try_recv().is_none());
}
