//! Broadcast Scheduler.
//!
//! A once-per-second countdown decides when to put a beacon or an emergency message on air.
//!
//! ## Modes
//!
//! - `Normal`: when the countdown expires the scheduler reads our transmit duty cycle from the
//!   radio. At or below [`DUTY_CYCLE_CEILING`] it sends the beacon (configured text plus a
//!   weather line) and rearms with the broadcast interval. Above the ceiling it stays silent and
//!   rearms with [`THROTTLE_RETRY_SECS`] so a congested channel is re-checked soon.
//! - `Emergency`: the emergency text goes out every emergency interval, regardless of duty
//!   cycle. Safety traffic outranks the airtime budget.
//!
//! Every mode change rearms the countdown with the new mode's interval. A send that the radio
//! rejects still rearms with the full interval so a dead link is not hammered every second.
//!
//! Nothing happens while `[broadcast] enabled` is false: the countdown is frozen, not drained.
//! The radio is never called while the state lock is held; an epoch counter makes sure a send
//! that raced with a mode change does not overwrite the fresh countdown.

use crate::config::{Config, ConfigHandle};
use crate::gateway::shared::SharedState;
use crate::logutil::escape_log;
use crate::meshtastic::{Destination, RadioLink};
use crate::metrics::GatewayMetrics;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Highest transmit duty cycle (percent) at which a normal beacon may be sent.
pub const DUTY_CYCLE_CEILING: f32 = 3.0;

/// Countdown used after a beacon was held back by the duty-cycle ceiling.
pub const THROTTLE_RETRY_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BroadcastMode {
    Normal,
    Emergency,
}

#[derive(Debug)]
struct SchedulerState {
    mode: BroadcastMode,
    countdown: i64,
    last_duty_cycle: f32,
    emergency_message: String,
    emergency_interval: u64,
    emergency_flag_seen: bool,
    epoch: u64,
}

/// Read-only view for dashboards ("next broadcast in ...").
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub mode: BroadcastMode,
    pub countdown_secs: i64,
    pub last_duty_cycle: f32,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Broadcasting is switched off; countdown untouched.
    Disabled,
    /// Countdown still running.
    Waiting { remaining: i64 },
    BeaconSent,
    EmergencySent,
    /// Duty cycle above the ceiling; nothing sent, short retry armed.
    Throttled { duty_cycle: f32 },
    /// The radio rejected the frame; the countdown was rearmed as if sent.
    SendFailed { mode: BroadcastMode },
    /// Broadcasting was switched off between the decision and the send.
    Aborted,
}

enum Due {
    Beacon { epoch: u64 },
    Emergency { epoch: u64, message: String },
}

pub struct BroadcastScheduler {
    state: Mutex<SchedulerState>,
    radio: Arc<RadioLink>,
    shared: SharedState,
    config: ConfigHandle,
    metrics: Arc<GatewayMetrics>,
}

impl BroadcastScheduler {
    pub fn new(
        radio: Arc<RadioLink>,
        shared: SharedState,
        config: ConfigHandle,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let cfg = config.current();
        let countdown = countdown_for(cfg.broadcast.interval_secs);
        shared.set_counter(countdown);
        Self {
            state: Mutex::new(SchedulerState {
                mode: BroadcastMode::Normal,
                countdown,
                last_duty_cycle: 0.0,
                emergency_message: cfg.emergency.message.clone(),
                emergency_interval: cfg.emergency.interval_secs,
                emergency_flag_seen: false,
                epoch: 0,
            }),
            radio,
            shared,
            config,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SchedulerStatus {
        let st = self.lock();
        SchedulerStatus {
            mode: st.mode,
            countdown_secs: st.countdown,
            last_duty_cycle: st.last_duty_cycle,
        }
    }

    pub fn mode(&self) -> BroadcastMode {
        self.lock().mode
    }

    /// Switch to emergency mode with `message` every `interval_secs`.
    ///
    /// Calling this while already in emergency mode replaces the message and restarts the
    /// countdown.
    pub fn start_emergency(&self, message: &str, interval_secs: u64) {
        let mut st = self.lock();
        st.mode = BroadcastMode::Emergency;
        st.emergency_message = message.to_string();
        st.emergency_interval = interval_secs;
        st.countdown = countdown_for(interval_secs);
        st.epoch += 1;
        self.shared.set_counter(st.countdown);
        info!(
            "Emergency broadcast started (every {}s): {}",
            interval_secs,
            escape_log(message)
        );
    }

    /// Return to normal beacons. Returns false if emergency mode was not active.
    pub fn stop_emergency(&self) -> bool {
        let normal_interval = self.config.current().broadcast.interval_secs;
        let mut st = self.lock();
        if st.mode != BroadcastMode::Emergency {
            return false;
        }
        st.mode = BroadcastMode::Normal;
        st.countdown = countdown_for(normal_interval);
        st.epoch += 1;
        self.shared.set_counter(st.countdown);
        info!("Emergency broadcast stopped");
        true
    }

    /// Follow edges of `[emergency] enabled` so a dashboard toggle acts like start/stop.
    fn follow_emergency_flag(&self, cfg: &Config) {
        let flag = cfg.emergency.enabled;
        let seen = {
            let mut st = self.lock();
            std::mem::replace(&mut st.emergency_flag_seen, flag)
        };
        if flag == seen {
            return;
        }
        if flag {
            self.start_emergency(&cfg.emergency.message, cfg.emergency.interval_secs);
        } else {
            self.stop_emergency();
        }
    }

    /// Advance the scheduler by one second.
    pub fn tick(&self) -> TickOutcome {
        let cfg = self.config.current();
        self.follow_emergency_flag(&cfg);
        if !cfg.broadcast.enabled {
            return TickOutcome::Disabled;
        }

        let due = {
            let mut st = self.lock();
            st.countdown -= 1;
            self.shared.set_counter(st.countdown.max(0));
            if st.countdown > 0 {
                return TickOutcome::Waiting {
                    remaining: st.countdown,
                };
            }
            match st.mode {
                BroadcastMode::Normal => Due::Beacon { epoch: st.epoch },
                BroadcastMode::Emergency => Due::Emergency {
                    epoch: st.epoch,
                    message: st.emergency_message.clone(),
                },
            }
        };

        match due {
            Due::Emergency { epoch, message } => self.send_emergency(epoch, &message),
            Due::Beacon { epoch } => self.send_beacon(epoch, &cfg),
        }
    }

    fn send_emergency(&self, epoch: u64, message: &str) -> TickOutcome {
        if !self.config.current().broadcast.enabled {
            return TickOutcome::Aborted;
        }
        let result = self.radio.send_text(message, &Destination::Broadcast);
        let rearm = self.lock().emergency_interval;
        self.rearm(epoch, countdown_for(rearm));
        match result {
            Ok(()) => {
                self.metrics.inc_emergency_sent();
                info!("Sent emergency broadcast: {}", escape_log(message));
                TickOutcome::EmergencySent
            }
            Err(e) => {
                self.metrics.inc_send_failures();
                warn!("Failed to send emergency broadcast: {}", e);
                TickOutcome::SendFailed {
                    mode: BroadcastMode::Emergency,
                }
            }
        }
    }

    fn send_beacon(&self, epoch: u64, cfg: &Config) -> TickOutcome {
        let duty_cycle = self.radio.transmit_duty_cycle();
        self.lock().last_duty_cycle = duty_cycle;

        if duty_cycle > DUTY_CYCLE_CEILING {
            self.rearm(epoch, THROTTLE_RETRY_SECS);
            self.metrics.inc_beacons_throttled();
            info!(
                "Beacon held back: duty cycle {:.2}% above {:.1}%, retry in {}s",
                duty_cycle, DUTY_CYCLE_CEILING, THROTTLE_RETRY_SECS
            );
            return TickOutcome::Throttled { duty_cycle };
        }

        let beacon = compose_beacon(&cfg.broadcast.message, &self.shared);
        if !self.config.current().broadcast.enabled {
            debug!("Beacon dropped: broadcasting disabled before send");
            return TickOutcome::Aborted;
        }
        let result = self.radio.send_text(&beacon, &Destination::Broadcast);
        self.rearm(epoch, countdown_for(cfg.broadcast.interval_secs));
        match result {
            Ok(()) => {
                self.metrics.inc_beacons_sent();
                info!(
                    "Sent beacon (duty cycle {:.2}%): {}",
                    duty_cycle,
                    escape_log(&beacon)
                );
                TickOutcome::BeaconSent
            }
            Err(e) => {
                self.metrics.inc_send_failures();
                warn!("Failed to send beacon: {}", e);
                TickOutcome::SendFailed {
                    mode: BroadcastMode::Normal,
                }
            }
        }
    }

    /// Set the countdown unless a mode change already replaced it.
    fn rearm(&self, epoch: u64, secs: i64) {
        let mut st = self.lock();
        if st.epoch == epoch {
            st.countdown = secs;
            self.shared.set_counter(secs);
        }
    }

    /// Tick once per second until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            match self.tick() {
                TickOutcome::Waiting { .. } | TickOutcome::Disabled => {}
                other => debug!("broadcast tick: {:?}", other),
            }
        }
        debug!("broadcast scheduler loop terminated");
    }
}

fn countdown_for(secs: u64) -> i64 {
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Beacon text: configured message followed by the current weather line.
pub fn compose_beacon(message: &str, shared: &SharedState) -> String {
    format!("{}\n{}", message, shared.weather().beacon_line())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::{LiveNode, MockRadio, RadioError, RadioTransport};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup(interval: u64, duty: f32) -> (Arc<MockRadio>, ConfigHandle, BroadcastScheduler) {
        let mut cfg = Config::default();
        cfg.broadcast.enabled = true;
        cfg.broadcast.interval_secs = interval;
        cfg.broadcast.message = "Hello mesh".to_string();
        cfg.emergency.interval_secs = 2;
        cfg.emergency.message = "EVACUATE".to_string();
        let handle = ConfigHandle::new(cfg);
        let radio = Arc::new(MockRadio::with_local_node(0x1234, duty));
        let scheduler = BroadcastScheduler::new(
            Arc::new(RadioLink::new(radio.clone())),
            SharedState::new(),
            handle.clone(),
            Arc::new(GatewayMetrics::new()),
        );
        (radio, handle, scheduler)
    }

    #[test]
    fn beacon_after_interval_when_duty_ok() {
        let (radio, _cfg, sched) = setup(3, 1.0);
        assert_eq!(sched.tick(), TickOutcome::Waiting { remaining: 2 });
        assert_eq!(sched.tick(), TickOutcome::Waiting { remaining: 1 });
        assert_eq!(sched.tick(), TickOutcome::BeaconSent);
        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with("Hello mesh\nTemp: "));
        assert_eq!(sent[0].destination, Destination::Broadcast);
        assert_eq!(sched.status().countdown_secs, 3);
    }

    #[test]
    fn duty_cycle_at_ceiling_still_sends() {
        let (radio, _cfg, sched) = setup(1, DUTY_CYCLE_CEILING);
        assert_eq!(sched.tick(), TickOutcome::BeaconSent);
        assert_eq!(radio.sent().len(), 1);
    }

    #[test]
    fn high_duty_cycle_throttles_with_short_retry() {
        let (radio, _cfg, sched) = setup(1, 3.5);
        assert_eq!(sched.tick(), TickOutcome::Throttled { duty_cycle: 3.5 });
        assert!(radio.sent().is_empty());
        let status = sched.status();
        assert_eq!(status.countdown_secs, THROTTLE_RETRY_SECS);
        assert!((status.last_duty_cycle - 3.5).abs() < f32::EPSILON);

        for _ in 0..(THROTTLE_RETRY_SECS - 1) {
            sched.tick();
        }
        radio.set_duty_cycle(0.5);
        assert_eq!(sched.tick(), TickOutcome::BeaconSent);
    }

    // Deliberate policy: emergency traffic ignores the duty-cycle ceiling.
    #[test]
    fn emergency_ignores_duty_cycle() {
        let (radio, _cfg, sched) = setup(100, 50.0);
        sched.start_emergency("EVACUATE", 2);
        assert_eq!(sched.tick(), TickOutcome::Waiting { remaining: 1 });
        assert_eq!(sched.tick(), TickOutcome::EmergencySent);
        assert_eq!(radio.sent()[0].text, "EVACUATE");
        assert_eq!(sched.status().countdown_secs, 2);
    }

    #[test]
    fn mode_transition_resets_countdown() {
        let (_radio, _cfg, sched) = setup(300, 0.0);
        for _ in 0..10 {
            sched.tick();
        }
        assert_eq!(sched.status().countdown_secs, 290);
        sched.start_emergency("help", 45);
        assert_eq!(sched.status().countdown_secs, 45);
        assert_eq!(sched.mode(), BroadcastMode::Emergency);
        sched.tick();
        assert!(sched.stop_emergency());
        assert_eq!(sched.status().countdown_secs, 300);
        assert!(!sched.stop_emergency());
    }

    #[test]
    fn disabled_does_not_drain_countdown() {
        let (radio, cfg, sched) = setup(5, 0.0);
        sched.tick();
        cfg.update(|c| c.broadcast.enabled = false);
        for _ in 0..20 {
            assert_eq!(sched.tick(), TickOutcome::Disabled);
        }
        assert_eq!(sched.status().countdown_secs, 4);
        assert!(radio.sent().is_empty());
    }

    #[test]
    fn failed_send_still_rearms_full_interval() {
        let (radio, _cfg, sched) = setup(2, 0.0);
        radio.set_fail_sends(true);
        sched.tick();
        assert_eq!(
            sched.tick(),
            TickOutcome::SendFailed {
                mode: BroadcastMode::Normal
            }
        );
        assert_eq!(sched.status().countdown_secs, 2);
    }

    /// Turns broadcasting off the first time the scheduler reads the node table.
    struct DisablingRadio {
        inner: MockRadio,
        config: ConfigHandle,
        armed: AtomicBool,
    }

    impl RadioTransport for DisablingRadio {
        fn send_text(&self, text: &str, destination: &Destination) -> Result<(), RadioError> {
            self.inner.send_text(text, destination)
        }

        fn node_table(&self) -> HashMap<String, LiveNode> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.config.update(|c| c.broadcast.enabled = false);
            }
            self.inner.node_table()
        }

        fn local_node_number(&self) -> Option<u32> {
            self.inner.local_node_number()
        }
    }

    #[test]
    fn disable_during_duty_check_drops_the_beacon() {
        let mut cfg = Config::default();
        cfg.broadcast.enabled = true;
        cfg.broadcast.interval_secs = 1;
        let handle = ConfigHandle::new(cfg);
        let radio = Arc::new(DisablingRadio {
            inner: MockRadio::with_local_node(0x1234, 0.5),
            config: handle.clone(),
            armed: AtomicBool::new(true),
        });
        let sched = BroadcastScheduler::new(
            Arc::new(RadioLink::new(radio.clone())),
            SharedState::new(),
            handle.clone(),
            Arc::new(GatewayMetrics::new()),
        );

        assert_eq!(sched.tick(), TickOutcome::Aborted);
        assert!(radio.inner.sent().is_empty());
        assert_eq!(sched.status().countdown_secs, 0);
        assert!(!handle.current().broadcast.enabled);

        // still expired, so the first enabled tick sends right away
        handle.update(|c| c.broadcast.enabled = true);
        assert_eq!(sched.tick(), TickOutcome::BeaconSent);
        assert_eq!(radio.inner.sent().len(), 1);
    }

    #[test]
    fn failed_emergency_send_rearms_emergency_interval() {
        let (radio, _cfg, sched) = setup(100, 0.0);
        radio.set_fail_sends(true);
        sched.start_emergency("EVACUATE", 2);
        sched.tick();
        assert_eq!(
            sched.tick(),
            TickOutcome::SendFailed {
                mode: BroadcastMode::Emergency
            }
        );
        assert_eq!(sched.status().countdown_secs, 2);
        assert_eq!(sched.mode(), BroadcastMode::Emergency);
    }

    #[test]
    fn emergency_flag_edges_switch_mode() {
        let (radio, cfg, sched) = setup(100, 0.0);
        cfg.update(|c| c.emergency.enabled = true);
        sched.tick();
        assert_eq!(sched.mode(), BroadcastMode::Emergency);
        assert_eq!(sched.tick(), TickOutcome::EmergencySent);
        assert_eq!(radio.sent()[0].text, "EVACUATE");
        cfg.update(|c| c.emergency.enabled = false);
        sched.tick();
        assert_eq!(sched.mode(), BroadcastMode::Normal);
    }

    #[test]
    fn countdown_is_mirrored_into_shared_state() {
        let (_radio, cfg, _) = setup(10, 0.0);
        let shared = SharedState::new();
        let sched = BroadcastScheduler::new(
            Arc::new(RadioLink::new(Arc::new(MockRadio::new()))),
            shared.clone(),
            cfg,
            Arc::new(GatewayMetrics::new()),
        );
        assert_eq!(shared.counter(), 10);
        sched.tick();
        assert_eq!(shared.counter(), 9);
    }

    #[tokio::test]
    async fn run_loop_stops_on_signal() {
        let (_radio, _cfg, sched) = setup(1000, 0.0);
        let sched = Arc::new(sched);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(sched.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop exits promptly")
            .unwrap();
    }
}
