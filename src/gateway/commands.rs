//! Command Dispatcher.
//!
//! Text messages beginning with `/` are parsed into a closed [`GatewayCommand`] and answered
//! with at most one reply. Anything that is not a recognized command produces no reply at all;
//! a handler failure is logged and also produces no reply, so the inbound loop never sees it.
//!
//! Replies are sized for a single mesh frame.

use crate::config::ConfigHandle;
use crate::gateway::geo::{distance_km, is_valid_coordinate};
use crate::gateway::presence::PresenceTracker;
use crate::logutil::escape_log;
use crate::meshtastic::MeshPacket;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use log::{trace, warn};
use std::sync::Arc;

pub const DISTANCE_USAGE: &str = "Please check format /distance 57.1234 14.1234";
pub const ADMIN_REPLY: &str = "Unknown admin command.";
pub const NO_REPEATER_POSITION: &str = "Repeater location not configured.";
const USERS_HEADER: &str = "Recent users:";
const RSSI_PLACEHOLDER: &str = "--.-- dBm";
const SNR_PLACEHOLDER: &str = "--.-- dB";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    Info,
    Signal,
    Users,
    /// `None` when the coordinates were missing or unusable.
    Distance(Option<(f64, f64)>),
    /// Sub-command text, if any. Admin is reserved; every form gets the same answer.
    Admin(Option<String>),
    Unrecognized,
}

impl GatewayCommand {
    /// Parse the first whitespace-delimited token as the command name.
    ///
    /// Names match exactly; `/INFO` is not a command.
    pub fn parse(raw: &str) -> Self {
        let mut tokens = raw.split_whitespace();
        let Some(name) = tokens.next() else {
            return GatewayCommand::Unrecognized;
        };
        let cmd = match name {
            "/info" => GatewayCommand::Info,
            "/signal" => GatewayCommand::Signal,
            "/users" => GatewayCommand::Users,
            "/distance" => {
                let args: Vec<&str> = tokens.collect();
                GatewayCommand::Distance(parse_coordinates(&args))
            }
            "/admin" => {
                let rest: Vec<&str> = tokens.collect();
                if rest.is_empty() {
                    GatewayCommand::Admin(None)
                } else {
                    GatewayCommand::Admin(Some(rest.join(" ")))
                }
            }
            _ => GatewayCommand::Unrecognized,
        };
        trace!("Parsed {:?} from '{}'", cmd, escape_log(raw));
        cmd
    }
}

fn parse_coordinates(args: &[&str]) -> Option<(f64, f64)> {
    if args.len() != 2 {
        return None;
    }
    let lat = args[0].parse::<f64>().ok()?;
    let lon = args[1].parse::<f64>().ok()?;
    is_valid_coordinate(lat, lon).then_some((lat, lon))
}

/// Round half away from zero to two decimals, so 7.125 renders as 7.13.
fn two_decimals(value: f64) -> String {
    format!("{:.2}", (value * 100.0).round() / 100.0)
}

pub fn signal_report(packet: &MeshPacket) -> String {
    let rssi = packet
        .rx_rssi
        .map(|v| format!("{} dBm", two_decimals(v)))
        .unwrap_or_else(|| RSSI_PLACEHOLDER.to_string());
    let snr = packet
        .rx_snr
        .map(|v| format!("{} dB", two_decimals(v)))
        .unwrap_or_else(|| SNR_PLACEHOLDER.to_string());
    format!("Repeater received you RSSI: {}  Received SNR: {}", rssi, snr)
}

/// Join names under a header, stopping before the reply would exceed `budget` characters.
///
/// A budget smaller than the header cuts the header itself.
pub fn users_reply(names: &[String], budget: usize) -> String {
    if names.is_empty() {
        return clip_chars(&format!("{} none", USERS_HEADER), budget);
    }
    let mut reply = clip_chars(USERS_HEADER, budget);
    let mut used = reply.chars().count();
    for name in names {
        let cost = 1 + name.chars().count();
        if used + cost > budget {
            break;
        }
        reply.push('\n');
        reply.push_str(name);
        used += cost;
    }
    reply
}

fn clip_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

pub struct CommandDispatcher {
    presence: Arc<PresenceTracker>,
    config: ConfigHandle,
}

impl CommandDispatcher {
    pub fn new(presence: Arc<PresenceTracker>, config: ConfigHandle) -> Self {
        Self { presence, config }
    }

    /// Reply for `text` received from `source`, or `None` if nothing should be sent.
    pub fn handle(&self, text: &str, source: &str, packet: &MeshPacket) -> Option<String> {
        self.handle_at(text, source, packet, self.presence.now())
    }

    pub fn handle_at(
        &self,
        text: &str,
        source: &str,
        packet: &MeshPacket,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let command = GatewayCommand::parse(text);
        match self.execute(&command, packet, now) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Command '{}' from {} failed: {}",
                    escape_log(text),
                    source,
                    e
                );
                None
            }
        }
    }

    fn execute(
        &self,
        command: &GatewayCommand,
        packet: &MeshPacket,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StorageError> {
        let cfg = self.config.current();
        let reply = match command {
            GatewayCommand::Info => format!(
                "Welcome to {}! Available commands:\n\
                 /users - online users\n\
                 /signal - get signal report\n\
                 /distance lat lon - distance to repeater\n\
                 Please wait 10sec before sending another cmd.",
                cfg.gateway.name
            ),
            GatewayCommand::Signal => signal_report(packet),
            GatewayCommand::Users => {
                let nodes = self
                    .presence
                    .recently_active_at(cfg.gateway.active_window_minutes, now)?;
                let names: Vec<String> =
                    nodes.iter().map(|n| n.display_name().to_string()).collect();
                users_reply(&names, cfg.gateway.users_reply_budget)
            }
            GatewayCommand::Distance(None) => DISTANCE_USAGE.to_string(),
            GatewayCommand::Distance(Some((lat, lon))) => match cfg.gateway.repeater_position() {
                Some((rlat, rlon)) => format!(
                    "Your distance from repeater: {:.2} km",
                    distance_km(rlat, rlon, *lat, *lon)
                ),
                None => NO_REPEATER_POSITION.to_string(),
            },
            GatewayCommand::Admin(_) => ADMIN_REPLY.to_string(),
            GatewayCommand::Unrecognized => return Ok(None),
        };
        Ok(Some(reply))
    }
}
