//! # Durable Node Registry
//!
//! The radio keeps a small node table and overwrites its oldest entries once full. This module
//! is the gateway's long-term memory of the mesh: a sled database with two trees.
//!
//! - `nodes`: one [`NodeRecord`] per node number, upserted, never deleted.
//! - `activity`: an append-only log of [`ActivityRecord`]s, keyed by receipt time so a
//!   "who was heard since T" query is a single range scan.
//!
//! ## Key layout
//!
//! | tree | key | value |
//! |---|---|---|
//! | `nodes` | node number, 4 bytes big-endian | bincode `NodeRecord` |
//! | `activity` | unix seconds (sign-flipped, 8 bytes BE) + sled id (8 bytes BE) | bincode `ActivityRecord` |
//!
//! Node upserts take a per-tree write lock so the read-merge-write of one record never
//! interleaves with another write; activity appends need no lock because every key is unique.

mod errors;

pub use errors::StorageError;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

const TREE_NODES: &str = "nodes";
const TREE_ACTIVITY: &str = "activity";

/// One row per mesh node ever observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_number: u32,
    pub node_id: String,
    pub long_name: String,
    pub short_name: String,
    pub mac_address: String,
    pub hardware_model: String,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node_number: u32, node_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_number,
            node_id: node_id.into(),
            long_name: String::new(),
            short_name: String::new(),
            mac_address: String::new(),
            hardware_model: String::new(),
            first_seen: now,
            updated_at: now,
        }
    }

    /// Best label for compact listings: short name, then long name, then the id.
    pub fn display_name(&self) -> &str {
        if !self.short_name.is_empty() {
            &self.short_name
        } else if !self.long_name.is_empty() {
            &self.long_name
        } else {
            &self.node_id
        }
    }
}

/// One entry per packet heard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub node_number: u32,
    pub node_id: String,
    pub heard_at: DateTime<Utc>,
    pub activity_kind: String,
}

/// Whether an upsert created or replaced the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Sled-backed node registry and activity log.
pub struct NodeStore {
    db: sled::Db,
    nodes: sled::Tree,
    activity: sled::Tree,
    node_write: Mutex<()>,
    last_heard: AtomicI64,
}

impl NodeStore {
    /// Open (or create) the registry rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        Self::from_db(db)
    }

    /// Throwaway in-memory registry, for tests and dry runs.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let nodes = db.open_tree(TREE_NODES)?;
        let activity = db.open_tree(TREE_ACTIVITY)?;
        let last_heard = match activity.last()? {
            Some((key, _)) => decode_activity_key(&key)?,
            None => i64::MIN,
        };
        Ok(Self {
            db,
            nodes,
            activity,
            node_write: Mutex::new(()),
            last_heard: AtomicI64::new(last_heard),
        })
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
        Ok(bincode::deserialize::<T>(bytes)?)
    }

    /// Insert the node, or replace the existing row for its number in place.
    ///
    /// `first_seen` of an existing row is kept; everything else comes from `record`.
    pub fn upsert_node(&self, mut record: NodeRecord) -> Result<UpsertOutcome, StorageError> {
        if record.node_id.trim().is_empty() {
            return Err(StorageError::InvalidRecord(format!(
                "node {} has no id",
                record.node_number
            )));
        }
        let key = record.node_number.to_be_bytes();
        let _guard = self.node_write.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = match self.nodes.get(key)? {
            Some(bytes) => {
                match Self::deserialize::<NodeRecord>(&bytes) {
                    Ok(existing) => record.first_seen = existing.first_seen,
                    Err(e) => warn!(
                        "Replacing unreadable node row {}: {}",
                        record.node_number, e
                    ),
                }
                UpsertOutcome::Updated
            }
            None => UpsertOutcome::Inserted,
        };
        record.updated_at = Utc::now();
        self.nodes.insert(key, Self::serialize(&record)?)?;
        debug!("node {} {:?}", record.node_id, outcome);
        Ok(outcome)
    }

    pub fn get_node(&self, node_number: u32) -> Result<Option<NodeRecord>, StorageError> {
        match self.nodes.get(node_number.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All known nodes, ordered by node number.
    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for entry in self.nodes.iter() {
            let (_, bytes) = entry?;
            out.push(Self::deserialize(&bytes)?);
        }
        Ok(out)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Append one activity entry. Timestamps never go backwards: an entry stamped earlier than
    /// the newest stored one is moved up to it.
    pub fn append_activity(&self, mut record: ActivityRecord) -> Result<(), StorageError> {
        let requested = record.heard_at.timestamp();
        let previous = self.last_heard.fetch_max(requested, Ordering::AcqRel);
        let secs = requested.max(previous);
        if secs != requested {
            warn!(
                "Activity for {} is {}s older than the newest entry; clamped forward",
                record.node_id,
                secs - requested
            );
            if let Some(adjusted) = Utc.timestamp_opt(secs, 0).single() {
                record.heard_at = adjusted;
            }
        }
        let seq = self.db.generate_id()?;
        let key = encode_activity_key(secs, seq);
        self.activity.insert(key, Self::serialize(&record)?)?;
        Ok(())
    }

    /// Entries with `since <= heard_at <= until`, oldest first.
    pub fn activity_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>, StorageError> {
        if until < since {
            return Ok(Vec::new());
        }
        let start = encode_activity_key(since.timestamp(), 0);
        let end = encode_activity_key(until.timestamp(), u64::MAX);
        let mut out = Vec::new();
        for entry in self.activity.range(start..=end) {
            let (_, bytes) = entry?;
            out.push(Self::deserialize(&bytes)?);
        }
        Ok(out)
    }

    /// Distinct node numbers heard within `[since, until]`.
    pub fn active_node_numbers(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeSet<u32>, StorageError> {
        Ok(self
            .activity_between(since, until)?
            .into_iter()
            .map(|a| a.node_number)
            .collect())
    }

    /// Timestamp of the newest activity entry, if any.
    pub fn latest_heard(&self) -> Option<DateTime<Utc>> {
        match self.last_heard.load(Ordering::Acquire) {
            i64::MIN => None,
            secs => Utc.timestamp_opt(secs, 0).single(),
        }
    }

    pub fn activity_count(&self) -> usize {
        self.activity.len()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

// Flipping the sign bit makes big-endian byte order match numeric order for negative times too.
fn encode_activity_key(secs: i64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&((secs as u64) ^ (1 << 63)).to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn decode_activity_key(key: &[u8]) -> Result<i64, StorageError> {
    let prefix: [u8; 8] = key
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(StorageError::CorruptKey {
            tree: TREE_ACTIVITY,
            len: key.len(),
        })?;
    Ok((u64::from_be_bytes(prefix) ^ (1 << 63)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn activity(num: u32, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            node_number: num,
            node_id: format!("!{:x}", num),
            heard_at: at,
            activity_kind: "TEXT_MESSAGE_APP".to_string(),
        }
    }

    #[test]
    fn activity_key_orders_by_time() {
        let a = encode_activity_key(-5, 9);
        let b = encode_activity_key(0, 0);
        let c = encode_activity_key(1_700_000_000, 1);
        assert!(a < b && b < c);
        assert_eq!(decode_activity_key(&c).unwrap(), 1_700_000_000);
        assert_eq!(decode_activity_key(&a).unwrap(), -5);
    }

    #[test]
    fn upsert_never_duplicates() {
        let store = NodeStore::temporary().unwrap();
        let mut rec = NodeRecord::new(42, "!2a");
        rec.short_name = "AAA".into();
        assert_eq!(store.upsert_node(rec.clone()).unwrap(), UpsertOutcome::Inserted);
        rec.short_name = "BBB".into();
        assert_eq!(store.upsert_node(rec.clone()).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.upsert_node(rec).unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.get_node(42).unwrap().unwrap().short_name, "BBB");
    }

    #[test]
    fn upsert_keeps_first_seen() {
        let store = NodeStore::temporary().unwrap();
        let mut rec = NodeRecord::new(7, "!7");
        rec.first_seen = Utc::now() - Duration::days(30);
        store.upsert_node(rec.clone()).unwrap();
        let first = store.get_node(7).unwrap().unwrap().first_seen;
        let mut again = NodeRecord::new(7, "!7");
        again.long_name = "Renamed".into();
        store.upsert_node(again).unwrap();
        let stored = store.get_node(7).unwrap().unwrap();
        assert_eq!(stored.first_seen, first);
        assert_eq!(stored.long_name, "Renamed");
    }

    #[test]
    fn upsert_rejects_missing_id_without_touching_row() {
        let store = NodeStore::temporary().unwrap();
        let mut rec = NodeRecord::new(9, "!9");
        rec.short_name = "KEEP".into();
        store.upsert_node(rec).unwrap();
        let bad = NodeRecord::new(9, "");
        assert!(matches!(
            store.upsert_node(bad),
            Err(StorageError::InvalidRecord(_))
        ));
        assert_eq!(store.get_node(9).unwrap().unwrap().short_name, "KEEP");
    }

    #[test]
    fn activity_range_is_inclusive_and_distinct() {
        let store = NodeStore::temporary().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.append_activity(activity(1, now - Duration::minutes(20))).unwrap();
        store.append_activity(activity(2, now - Duration::minutes(5))).unwrap();
        store.append_activity(activity(2, now - Duration::minutes(4))).unwrap();
        store.append_activity(activity(3, now)).unwrap();

        let set = store
            .active_node_numbers(now - Duration::minutes(10), now)
            .unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(store.activity_count(), 4);
    }

    #[test]
    fn activity_timestamps_do_not_go_backwards() {
        let store = NodeStore::temporary().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.append_activity(activity(1, now)).unwrap();
        store.append_activity(activity(2, now - Duration::seconds(30))).unwrap();
        let all = store
            .activity_between(now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].node_number, 2);
        assert_eq!(all[1].heard_at, now);
        assert_eq!(store.latest_heard(), Some(now));
    }

    #[test]
    fn latest_heard_is_empty_for_new_store() {
        let store = NodeStore::temporary().unwrap();
        assert_eq!(store.latest_heard(), None);
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path()).unwrap();
            store.upsert_node(NodeRecord::new(5, "!5")).unwrap();
            store.flush().unwrap();
        }
        let store = NodeStore::open(dir.path()).unwrap();
        assert!(store.get_node(5).unwrap().is_some());
    }
}
