mod common;

use meshgate::config::ConfigHandle;
use meshgate::gateway::scheduler::{DUTY_CYCLE_CEILING, THROTTLE_RETRY_SECS};
use meshgate::gateway::{BroadcastMode, BroadcastScheduler, SharedState, TickOutcome};
use meshgate::meshtastic::{Destination, MockRadio, RadioLink};
use meshgate::metrics::GatewayMetrics;
use std::sync::Arc;

type Fixture = (Arc<MockRadio>, ConfigHandle, Arc<GatewayMetrics>, BroadcastScheduler);

fn scheduler(interval: u64, duty: f32) -> Fixture {
    let cfg = ConfigHandle::new(common::test_config(interval));
    let radio = Arc::new(MockRadio::with_local_node(0x99, duty));
    let metrics = Arc::new(GatewayMetrics::new());
    let s = BroadcastScheduler::new(
        Arc::new(RadioLink::new(radio.clone())),
        SharedState::new(),
        cfg.clone(),
        metrics.clone(),
    );
    (radio, cfg, metrics, s)
}

#[test]
fn never_transmits_above_ceiling_in_normal_mode() {
    let (radio, _cfg, metrics, s) = scheduler(2, DUTY_CYCLE_CEILING + 0.01);
    for _ in 0..500 {
        let outcome = s.tick();
        assert_ne!(outcome, TickOutcome::BeaconSent);
    }
    assert!(radio.sent().is_empty());
    assert!(metrics.snapshot().beacons_throttled > 0);
}

#[test]
fn throttled_then_recovers_after_retry_period() {
    let (radio, _cfg, _m, s) = scheduler(1, 4.0);
    assert!(matches!(s.tick(), TickOutcome::Throttled { .. }));
    radio.set_duty_cycle(1.0);
    let mut sent_at = None;
    for i in 1..=THROTTLE_RETRY_SECS {
        if s.tick() == TickOutcome::BeaconSent {
            sent_at = Some(i);
            break;
        }
    }
    assert_eq!(sent_at, Some(THROTTLE_RETRY_SECS));
}

#[test]
fn emergency_transmits_on_busy_channel() {
    let (radio, _cfg, metrics, s) = scheduler(300, 25.0);
    s.start_emergency("Storm warning", 3);
    let outcomes: Vec<TickOutcome> = (0..9).map(|_| s.tick()).collect();
    let sent = outcomes
        .iter()
        .filter(|o| **o == TickOutcome::EmergencySent)
        .count();
    assert_eq!(sent, 3);
    assert!(radio
        .sent()
        .iter()
        .all(|f| f.text == "Storm warning" && f.destination == Destination::Broadcast));
    assert_eq!(metrics.snapshot().emergency_sent, 3);
}

#[test]
fn transition_discards_previous_countdown() {
    let (_radio, cfg, _m, s) = scheduler(300, 0.0);
    s.tick();
    s.tick();
    s.start_emergency("x", 5);
    assert_eq!(s.status().countdown_secs, 5);
    assert_eq!(s.status().mode, BroadcastMode::Emergency);
    s.stop_emergency();
    assert_eq!(s.status().countdown_secs, 300);

    cfg.update(|c| c.broadcast.interval_secs = 120);
    s.start_emergency("y", 5);
    s.stop_emergency();
    assert_eq!(s.status().countdown_secs, 120);
}

#[test]
fn toggling_config_flag_drives_emergency_mode() {
    let (radio, cfg, _m, s) = scheduler(300, 0.0);
    cfg.update(|c| c.emergency.enabled = true);
    s.tick();
    assert_eq!(s.mode(), BroadcastMode::Emergency);
    for _ in 0..4 {
        s.tick();
    }
    assert_eq!(radio.sent().len(), 1);
    assert_eq!(radio.sent()[0].text, "Flooding at the river, avoid the area");

    cfg.update(|c| c.emergency.enabled = false);
    s.tick();
    assert_eq!(s.mode(), BroadcastMode::Normal);
    // An explicit start survives while the flag stays off.
    s.start_emergency("manual", 5);
    s.tick();
    assert_eq!(s.mode(), BroadcastMode::Emergency);
}

#[test]
fn beacon_carries_weather_line() {
    let cfg = ConfigHandle::new(common::test_config(1));
    let radio = Arc::new(MockRadio::with_local_node(0x99, 0.0));
    let shared = SharedState::new();
    shared.set_weather(meshgate::gateway::shared::WeatherSnapshot::from_station_reading(
        12.04, 11.9, 990.0, 80.0, 0.0,
    ));
    let s = BroadcastScheduler::new(
        Arc::new(RadioLink::new(radio.clone())),
        shared,
        cfg,
        Arc::new(GatewayMetrics::new()),
    );
    assert_eq!(s.tick(), TickOutcome::BeaconSent);
    assert_eq!(
        radio.sent()[0].text,
        "Repeater online\nTemp: 12.0C Hum: 80.0% Pres: 990.0hPa"
    );
}
