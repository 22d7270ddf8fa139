//! Gateway wiring.
//!
//! [`Gateway`] owns one instance of every component and runs them as independent tokio tasks:
//!
//! ```text
//!  radio transport ──MeshPacket──▶ inbound loop ──▶ PresenceTracker (activity, identity)
//!                                        │
//!                                        └──▶ CommandDispatcher ──reply──▶ RadioLink
//!
//!  BroadcastScheduler (1 s tick) ─────────────────────────────────────────▶ RadioLink
//!  PresenceTracker::run_sync_loop (reconciliation sweep) ◀── RadioLink::node_table
//! ```
//!
//! All loops watch the same stop signal and exit within one tick of [`Gateway::shutdown`].

use crate::config::ConfigHandle;
use crate::gateway::commands::CommandDispatcher;
use crate::gateway::presence::PresenceTracker;
use crate::gateway::scheduler::BroadcastScheduler;
use crate::gateway::shared::SharedState;
use crate::logutil::escape_log;
use crate::meshtastic::{
    Destination, MeshPacket, PortCategory, RadioError, RadioLink, RadioTransport,
};
use crate::metrics::GatewayMetrics;
use crate::storage::NodeStore;
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// `from` value used for operator messages in the message log.
pub const OPERATOR_SENDER: &str = "me";

pub struct Gateway {
    config: ConfigHandle,
    shared: SharedState,
    radio: Arc<RadioLink>,
    presence: Arc<PresenceTracker>,
    scheduler: Arc<BroadcastScheduler>,
    dispatcher: CommandDispatcher,
    metrics: Arc<GatewayMetrics>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(
        config: ConfigHandle,
        store: Arc<NodeStore>,
        transport: Arc<dyn RadioTransport>,
    ) -> Self {
        let metrics = Arc::new(GatewayMetrics::new());
        let shared = SharedState::new();
        let radio = Arc::new(RadioLink::new(transport));
        let presence = Arc::new(PresenceTracker::new(store, radio.clone(), metrics.clone()));
        let scheduler = Arc::new(BroadcastScheduler::new(
            radio.clone(),
            shared.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let dispatcher = CommandDispatcher::new(presence.clone(), config.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shared,
            radio,
            presence,
            scheduler,
            dispatcher,
            metrics,
            shutdown_tx,
        }
    }

    /// Open the node registry named in the configuration and build the gateway around it.
    pub fn open(config: ConfigHandle, transport: Arc<dyn RadioTransport>) -> Result<Self> {
        let path = config.current().gateway.database_path.clone();
        let store = NodeStore::open(&path)
            .map_err(|e| anyhow!("Failed to open node database {}: {}", path, e))?;
        Ok(Self::new(config, Arc::new(store), transport))
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn scheduler(&self) -> &Arc<BroadcastScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Ask every loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Process one inbound packet and return the reply that was sent, if any.
    ///
    /// Every packet marks its sender active. Text messages go to the message log and then to
    /// the dispatcher; a reply is addressed to the sender only.
    pub fn handle_packet(&self, packet: &MeshPacket) -> Option<String> {
        self.metrics.inc_packets_seen();
        if let Err(e) = self.presence.record_packet(packet) {
            warn!("Failed to record packet from {}: {}", packet.sender_id(), e);
        }

        if packet.category != PortCategory::TextMessage {
            return None;
        }
        let text = packet.text_body()?;
        let sender = packet.sender_id();
        debug!("text from {}: {}", sender, escape_log(text));
        self.shared.add_message(&sender, text);

        let reply = self.dispatcher.handle(text, &sender, packet)?;
        match self
            .radio
            .send_text(&reply, &Destination::Node(sender.clone()))
        {
            Ok(()) => {
                self.metrics.inc_replies_sent();
                Some(reply)
            }
            Err(e) => {
                self.metrics.inc_send_failures();
                warn!("Failed to reply to {}: {}", sender, e);
                None
            }
        }
    }

    /// Broadcast a message typed by the operator and log it as ours.
    pub fn send_operator_message(&self, text: &str) -> Result<(), RadioError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RadioError::SendFailed("empty message".to_string()));
        }
        self.radio.send_text(text, &Destination::Broadcast)?;
        self.shared.add_message(OPERATOR_SENDER, text);
        info!("Operator message sent: {}", escape_log(text));
        Ok(())
    }

    /// Seed the registry, start the background loops and route inbound packets until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<MeshPacket>,
    ) -> Result<()> {
        info!("Gateway '{}' starting", self.config.current().gateway.name);

        let report = self.presence.sync_now();
        info!(
            "Startup sweep: {} new, {} updated, {} rejected",
            report.inserted, report.updated, report.rejected
        );

        let scheduler_task = tokio::spawn(self.scheduler.clone().run(self.shutdown_signal()));
        let sync_task = tokio::spawn(
            self.presence
                .clone()
                .run_sync_loop(self.config.clone(), self.shutdown_signal()),
        );

        let mut shutdown = self.shutdown_signal();
        let mut inbound_open = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                packet = inbound.recv(), if inbound_open => match packet {
                    Some(packet) => {
                        self.handle_packet(&packet);
                    }
                    None => {
                        warn!("Radio event stream closed; waiting for shutdown");
                        inbound_open = false;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        for (name, task) in [("scheduler", scheduler_task), ("sync", sync_task)] {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
        if let Err(e) = self.presence.store().flush() {
            warn!("Failed to flush node database: {}", e);
        }
        info!("Gateway stopped");
        Ok(())
    }
}
