//! Node Presence Tracker.
//!
//! Keeps the durable node registry in step with the radio and answers "who has been heard
//! lately". Two write paths feed the same [`NodeStore`]:
//!
//! - the reconciliation sweep ([`PresenceTracker::sync_now`]) copies the radio's whole live
//!   node table, once at startup and then every `sync_interval_secs`;
//! - [`PresenceTracker::record_packet`] upserts identity from NODEINFO packets as they arrive
//!   and appends one activity entry for every packet heard.
//!
//! There is no "online" flag. Liveness is a range query over the activity log.

use crate::config::ConfigHandle;
use crate::meshtastic::{
    format_node_id, parse_node_id, LiveNode, MeshPacket, PacketPayload, PortCategory, RadioLink,
};
use crate::metrics::GatewayMetrics;
use crate::storage::{ActivityRecord, NodeRecord, NodeStore, StorageError, UpsertOutcome};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Result of one reconciliation sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// What recording a single packet did to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOutcome {
    pub metadata: Option<UpsertOutcome>,
    pub metadata_rejected: bool,
}

pub struct PresenceTracker {
    store: Arc<NodeStore>,
    radio: Arc<RadioLink>,
    metrics: Arc<GatewayMetrics>,
}

impl PresenceTracker {
    pub fn new(store: Arc<NodeStore>, radio: Arc<RadioLink>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            store,
            radio,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Copy every entry of the radio's live node table into durable storage.
    ///
    /// Entries without a usable node number are skipped; a storage failure on one entry
    /// does not stop the sweep.
    pub fn sync_now(&self) -> SyncReport {
        let table = self.radio.node_table();
        let mut report = SyncReport::default();
        for (key, live) in table {
            let Some(record) = record_from_live(&key, &live) else {
                debug!("sync: skipping node table entry '{}' without a node number", key);
                report.rejected += 1;
                continue;
            };
            match self.store.upsert_node(record) {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(StorageError::InvalidRecord(reason)) => {
                    warn!("sync: rejected node table entry '{}': {}", key, reason);
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!("sync: failed to store node '{}': {}", key, e);
                    report.failed += 1;
                }
            }
        }
        if let Err(e) = self.store.flush() {
            warn!("sync: flush failed: {}", e);
        }
        self.metrics.inc_sync_runs();
        info!(
            "Node sync complete: {} new, {} updated, {} rejected, {} failed",
            report.inserted, report.updated, report.rejected, report.failed
        );
        report
    }

    /// Record an inbound packet heard now.
    pub fn record_packet(&self, packet: &MeshPacket) -> Result<PacketOutcome, StorageError> {
        self.record_packet_at(packet, Utc::now())
    }

    /// Record an inbound packet heard at `heard_at`.
    ///
    /// NODEINFO packets also upsert the sender's identity. A NODEINFO packet without a usable
    /// user block is rejected for the upsert only; the activity entry is still written.
    pub fn record_packet_at(
        &self,
        packet: &MeshPacket,
        heard_at: DateTime<Utc>,
    ) -> Result<PacketOutcome, StorageError> {
        let mut outcome = PacketOutcome {
            metadata: None,
            metadata_rejected: false,
        };

        if packet.category == PortCategory::NodeInfo {
            match record_from_packet(packet) {
                Some(record) => match self.store.upsert_node(record) {
                    Ok(result) => outcome.metadata = Some(result),
                    Err(StorageError::InvalidRecord(reason)) => {
                        warn!("Rejected node info from {}: {}", packet.sender_id(), reason);
                        outcome.metadata_rejected = true;
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    warn!(
                        "Rejected node info from {}: missing user block",
                        packet.sender_id()
                    );
                    outcome.metadata_rejected = true;
                }
            }
            if outcome.metadata_rejected {
                self.metrics.inc_packets_rejected();
            }
        }

        self.store.append_activity(ActivityRecord {
            node_number: packet.from,
            node_id: packet.sender_id(),
            heard_at,
            activity_kind: packet.category.as_str().to_string(),
        })?;
        Ok(outcome)
    }

    pub fn lookup(&self, node_number: u32) -> Result<Option<NodeRecord>, StorageError> {
        self.store.get_node(node_number)
    }

    /// Distinct nodes heard within the last `window_minutes`, as of `now`.
    ///
    /// A zero window is empty by definition.
    pub fn recently_active_numbers_at(
        &self,
        window_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<u32>, StorageError> {
        if window_minutes == 0 {
            return Ok(BTreeSet::new());
        }
        let since = now - ChronoDuration::minutes(i64::from(window_minutes));
        self.store.active_node_numbers(since, now)
    }

    /// Registry rows of nodes heard within the window, ordered by node number.
    ///
    /// Nodes heard but never identified have no row and are left out.
    pub fn recently_active_at(
        &self,
        window_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeRecord>, StorageError> {
        let mut out = Vec::new();
        for num in self.recently_active_numbers_at(window_minutes, now)? {
            match self.store.get_node(num)? {
                Some(record) => out.push(record),
                None => debug!("active node {} has no registry row yet", format_node_id(num)),
            }
        }
        Ok(out)
    }

    pub fn recently_active(&self, window_minutes: u32) -> Result<Vec<NodeRecord>, StorageError> {
        self.recently_active_at(window_minutes, self.now())
    }

    /// Wall clock, but never earlier than the newest activity entry.
    ///
    /// The store keeps activity timestamps monotonic, so after the system clock steps back a
    /// fresh entry can sit slightly in the future; queries "as of now" must still see it.
    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        match self.store.latest_heard() {
            Some(latest) if latest > wall => latest,
            _ => wall,
        }
    }

    /// Periodic reconciliation loop. Exits within one tick of `shutdown` turning true.
    pub async fn run_sync_loop(
        self: Arc<Self>,
        config: ConfigHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut elapsed: u64 = 0;
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
            elapsed += 1;
            let every = config.current().gateway.sync_interval_secs.max(1);
            if elapsed >= every {
                elapsed = 0;
                self.sync_now();
            }
        }
        debug!("node sync loop terminated");
    }
}

fn record_from_live(key: &str, live: &LiveNode) -> Option<NodeRecord> {
    let num = live.num.or_else(|| parse_node_id(key))?;
    let user = live.user.clone().unwrap_or_default();
    let node_id = if !user.id.is_empty() {
        user.id
    } else {
        format_node_id(num)
    };
    let mut record = NodeRecord::new(num, node_id);
    record.long_name = user.long_name;
    record.short_name = user.short_name;
    record.mac_address = user.macaddr;
    record.hardware_model = user.hw_model;
    Some(record)
}

fn record_from_packet(packet: &MeshPacket) -> Option<NodeRecord> {
    let PacketPayload::User(Some(user)) = &packet.payload else {
        return None;
    };
    let node_id = if !packet.from_id.is_empty() {
        packet.from_id.clone()
    } else {
        user.id.clone()
    };
    let mut record = NodeRecord::new(packet.from, node_id);
    record.long_name = user.long_name.clone();
    record.short_name = user.short_name.clone();
    record.mac_address = user.macaddr.clone();
    record.hardware_model = user.hw_model.clone();
    Some(record)
}
