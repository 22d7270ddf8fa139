//! Test utilities & fixtures shared by the integration tests.

use meshgate::config::{Config, ConfigHandle};
use meshgate::gateway::Gateway;
use meshgate::meshtastic::{MockRadio, NodeUser};
use meshgate::storage::NodeStore;
use std::sync::Arc;

/// Config with beacons on a short interval and the repeater placed in Jönköping.
#[allow(dead_code)]
pub fn test_config(interval_secs: u64) -> Config {
    let mut cfg = Config::default();
    cfg.broadcast.enabled = true;
    cfg.broadcast.interval_secs = interval_secs;
    cfg.broadcast.message = "Repeater online".to_string();
    cfg.emergency.interval_secs = 5;
    cfg.emergency.message = "Flooding at the river, avoid the area".to_string();
    cfg.gateway.repeater_latitude = Some(57.7826);
    cfg.gateway.repeater_longitude = Some(14.1618);
    cfg
}

#[allow(dead_code)]
pub fn user(num: u32, short: &str) -> NodeUser {
    NodeUser {
        id: format!("!{:x}", num),
        long_name: format!("{} station", short),
        short_name: short.to_string(),
        macaddr: String::new(),
        hw_model: "HELTEC_V3".to_string(),
    }
}

/// Gateway over a sled database in a temp dir. Keep the `TempDir` alive for the test.
#[allow(dead_code)]
pub fn gateway_on_disk(cfg: Config) -> (tempfile::TempDir, Arc<MockRadio>, Arc<Gateway>) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = NodeStore::open(tmp.path().join("nodedb")).expect("open store");
    let radio = Arc::new(MockRadio::with_local_node(0x0a0b0c0d, 0.8));
    let gw = Gateway::new(ConfigHandle::new(cfg), Arc::new(store), radio.clone());
    (tmp, radio, Arc::new(gw))
}
