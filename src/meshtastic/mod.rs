//! # Meshtastic Radio Collaborator
//!
//! The gateway never speaks the Meshtastic wire protocol itself. Whatever owns the serial or
//! network link to the device implements [`RadioTransport`] and feeds decoded packets into the
//! gateway as [`MeshPacket`] values over a tokio channel.
//!
//! ## Contract
//!
//! - [`RadioTransport::send_text`] queues one text frame for a single node or for everyone.
//! - [`RadioTransport::node_table`] returns the device's live node table. The device keeps a
//!   bounded table and evicts old entries, which is why the gateway copies it into durable storage.
//! - [`RadioTransport::local_node_number`] identifies our own entry in that table; its
//!   `device_metrics.air_util_tx` is the measured transmit duty cycle.
//!
//! All components share one [`RadioLink`], which serializes sends so a transport that is not
//! safe for concurrent writes still sees one frame at a time.
//!
//! ## Test doubles
//!
//! [`MockRadio`] records every send and serves a scripted node table; [`DisconnectedRadio`]
//! stands in when no device is attached so the gateway degrades to logging instead of exiting.

use crate::logutil::truncate_for_log;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by a radio transport.
#[derive(Debug, Error)]
pub enum RadioError {
    /// No device is attached or the link dropped.
    #[error("radio not connected")]
    NotConnected,

    /// The device refused or failed to queue the frame.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Where an outgoing text frame goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every node on the channel (`^all` in Meshtastic terms).
    Broadcast,
    /// A single node by its string id, e.g. `!1a2b3c4d`.
    Node(String),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Broadcast => write!(f, "^all"),
            Destination::Node(id) => write!(f, "{}", id),
        }
    }
}

/// Identity block of a node, as carried by NODEINFO packets and the live node table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUser {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    #[serde(default)]
    pub macaddr: String,
    #[serde(default)]
    pub hw_model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    /// Percentage of recent airtime used by this node's own transmissions.
    pub air_util_tx: Option<f32>,
    #[serde(default)]
    pub channel_utilization: Option<f32>,
    #[serde(default)]
    pub battery_level: Option<u32>,
}

/// One row of the device's live node table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveNode {
    pub num: Option<u32>,
    pub user: Option<NodeUser>,
    #[serde(default)]
    pub device_metrics: Option<DeviceMetrics>,
}

/// Application category of an inbound packet (Meshtastic port number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortCategory {
    TextMessage,
    NodeInfo,
    Position,
    Telemetry,
    Alert,
    Other(String),
}

impl PortCategory {
    /// Meshtastic port name, stored as the activity kind.
    pub fn as_str(&self) -> &str {
        match self {
            PortCategory::TextMessage => "TEXT_MESSAGE_APP",
            PortCategory::NodeInfo => "NODEINFO_APP",
            PortCategory::Position => "POSITION_APP",
            PortCategory::Telemetry => "TELEMETRY_APP",
            PortCategory::Alert => "ALERT_APP",
            PortCategory::Other(name) => name.as_str(),
        }
    }

    pub fn from_port_name(name: &str) -> Self {
        match name {
            "TEXT_MESSAGE_APP" => PortCategory::TextMessage,
            "NODEINFO_APP" => PortCategory::NodeInfo,
            "POSITION_APP" => PortCategory::Position,
            "TELEMETRY_APP" => PortCategory::Telemetry,
            "ALERT_APP" => PortCategory::Alert,
            other => PortCategory::Other(other.to_string()),
        }
    }
}

/// Decoded content of an inbound packet, as far as the gateway cares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketPayload {
    Text(String),
    /// Identity broadcast. `None` when the packet claimed NODEINFO but carried no user block.
    User(Option<NodeUser>),
    Empty,
}

/// Inbound packet event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub from: u32,
    /// String id of the sender; may be empty when the device could not resolve it.
    #[serde(default)]
    pub from_id: String,
    pub category: PortCategory,
    pub payload: PacketPayload,
    #[serde(default)]
    pub rx_rssi: Option<f64>,
    #[serde(default)]
    pub rx_snr: Option<f64>,
}

impl MeshPacket {
    pub fn text(from: u32, text: &str) -> Self {
        Self {
            from,
            from_id: format_node_id(from),
            category: PortCategory::TextMessage,
            payload: PacketPayload::Text(text.to_string()),
            rx_rssi: None,
            rx_snr: None,
        }
    }

    pub fn node_info(from: u32, user: NodeUser) -> Self {
        Self {
            from,
            from_id: format_node_id(from),
            category: PortCategory::NodeInfo,
            payload: PacketPayload::User(Some(user)),
            rx_rssi: None,
            rx_snr: None,
        }
    }

    pub fn with_signal(mut self, rssi: Option<f64>, snr: Option<f64>) -> Self {
        self.rx_rssi = rssi;
        self.rx_snr = snr;
        self
    }

    /// Sender id, falling back to the hex form of the node number.
    pub fn sender_id(&self) -> String {
        if self.from_id.is_empty() {
            format_node_id(self.from)
        } else {
            self.from_id.clone()
        }
    }

    pub fn text_body(&self) -> Option<&str> {
        match &self.payload {
            PacketPayload::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// Render a node number in Meshtastic's string form: `!` followed by lowercase hex.
pub fn format_node_id(num: u32) -> String {
    format!("!{:x}", num)
}

/// Parse `!1a2b3c4d`, `0x1a2b3c4d` or a decimal node number.
pub fn parse_node_id(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    s.parse::<u32>().ok()
}

/// What the gateway needs from the device link.
pub trait RadioTransport: Send + Sync {
    fn send_text(&self, text: &str, destination: &Destination) -> Result<(), RadioError>;

    fn node_table(&self) -> HashMap<String, LiveNode>;

    fn local_node_number(&self) -> Option<u32>;
}

/// Shared handle to the transport used by every component.
pub struct RadioLink {
    inner: Arc<dyn RadioTransport>,
    send_lock: Mutex<()>,
}

impl RadioLink {
    pub fn new(inner: Arc<dyn RadioTransport>) -> Self {
        Self {
            inner,
            send_lock: Mutex::new(()),
        }
    }

    pub fn send_text(&self, text: &str, destination: &Destination) -> Result<(), RadioError> {
        let _guard = self.send_lock.lock().unwrap_or_else(|e| e.into_inner());
        debug!("-> {}: {}", destination, truncate_for_log(text, 120));
        self.inner.send_text(text, destination)
    }

    pub fn node_table(&self) -> HashMap<String, LiveNode> {
        self.inner.node_table()
    }

    pub fn local_node_number(&self) -> Option<u32> {
        self.inner.local_node_number()
    }

    /// Measured transmit duty cycle of our own node, in percent.
    ///
    /// Missing metrics read as 0.0: a device that has not reported yet has not been transmitting.
    pub fn transmit_duty_cycle(&self) -> f32 {
        let Some(num) = self.local_node_number() else {
            return 0.0;
        };
        let table = self.node_table();
        let entry = table
            .get(&format_node_id(num))
            .or_else(|| table.values().find(|n| n.num == Some(num)));
        entry
            .and_then(|n| n.device_metrics.as_ref())
            .and_then(|m| m.air_util_tx)
            .unwrap_or(0.0)
    }
}

/// Placeholder transport for a gateway started without a device.
#[derive(Debug, Default)]
pub struct DisconnectedRadio;

impl RadioTransport for DisconnectedRadio {
    fn send_text(&self, text: &str, destination: &Destination) -> Result<(), RadioError> {
        warn!(
            "No radio attached; dropping message to {}: {}",
            destination,
            truncate_for_log(text, 80)
        );
        Err(RadioError::NotConnected)
    }

    fn node_table(&self) -> HashMap<String, LiveNode> {
        HashMap::new()
    }

    fn local_node_number(&self) -> Option<u32> {
        None
    }
}

/// A text frame captured by [`MockRadio`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub text: String,
    pub destination: Destination,
}

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<SentFrame>,
    nodes: HashMap<String, LiveNode>,
    local: Option<u32>,
    fail_sends: bool,
}

/// In-memory transport for tests and dry runs.
#[derive(Debug, Default)]
pub struct MockRadio {
    state: Mutex<MockState>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock whose own node (`local`) reports the given transmit duty cycle.
    pub fn with_local_node(local: u32, air_util_tx: f32) -> Self {
        let radio = Self::new();
        radio.set_local_node(local, air_util_tx);
        radio
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_local_node(&self, local: u32, air_util_tx: f32) {
        let mut state = self.lock();
        state.local = Some(local);
        let entry = state.nodes.entry(format_node_id(local)).or_default();
        entry.num = Some(local);
        entry.device_metrics = Some(DeviceMetrics {
            air_util_tx: Some(air_util_tx),
            ..Default::default()
        });
    }

    pub fn set_duty_cycle(&self, air_util_tx: f32) {
        let local = self.lock().local;
        if let Some(local) = local {
            self.set_local_node(local, air_util_tx);
        }
    }

    pub fn insert_node(&self, num: u32, user: NodeUser) {
        let mut state = self.lock();
        let entry = state.nodes.entry(format_node_id(num)).or_default();
        entry.num = Some(num);
        entry.user = Some(user);
    }

    pub fn insert_raw(&self, key: &str, node: LiveNode) {
        self.lock().nodes.insert(key.to_string(), node);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }
}

impl RadioTransport for MockRadio {
    fn send_text(&self, text: &str, destination: &Destination) -> Result<(), RadioError> {
        let mut state = self.lock();
        if state.fail_sends {
            return Err(RadioError::SendFailed("mock failure".to_string()));
        }
        state.sent.push(SentFrame {
            text: text.to_string(),
            destination: destination.clone(),
        });
        Ok(())
    }

    fn node_table(&self) -> HashMap<String, LiveNode> {
        self.lock().nodes.clone()
    }

    fn local_node_number(&self) -> Option<u32> {
        self.lock().local
    }
}
