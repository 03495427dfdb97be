//! Multi-version concurrency control for transactional key/value state.
//!
//! Every key owns a chain of versions tagged with the committing
//! transaction's timestamp. Readers pick the newest version at or before
//! their start timestamp without blocking writers; writers buffer into a
//! write set and validate at commit under a single commit lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{HlcTimestamp, HybridLogicalClock};
use crate::error::{MeshError, Result};

/// Transaction isolation levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Commits unconditionally
    ReadCommitted,
    /// Aborts when a read key gained a newer committed version
    RepeatableRead,
    /// Additionally aborts on write-write races
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(MeshError::InvalidParams(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct Version {
    ts: HlcTimestamp,
    tx_id: Uuid,
    /// `None` marks a deletion tombstone
    value: Option<Value>,
}

/// An open transaction. Dropped without commit, its buffered writes are
/// simply discarded.
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    start: HlcTimestamp,
    isolation: IsolationLevel,
    read_set: Vec<(String, Option<HlcTimestamp>)>,
    write_set: BTreeMap<String, Option<Value>>,
    closed: bool,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start_ts(&self) -> &HlcTimestamp {
        &self.start
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(MeshError::TransactionClosed);
        }
        Ok(())
    }
}

/// The versioned store. Cheap to clone and share.
#[derive(Clone)]
pub struct MvccStore {
    clock: Arc<HybridLogicalClock>,
    chains: Arc<RwLock<HashMap<String, Vec<Version>>>>,
    /// Start timestamps of open transactions, for the garbage collector
    active: Arc<Mutex<HashMap<Uuid, HlcTimestamp>>>,
    /// Serializes validation and apply at commit
    commit_lock: Arc<Mutex<()>>,
}

impl MvccStore {
    pub fn new(clock: Arc<HybridLogicalClock>) -> Self {
        Self {
            clock,
            chains: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open a transaction at the current timestamp.
    pub fn begin(&self, isolation: IsolationLevel) -> Transaction {
        let id = Uuid::new_v4();
        let start = self.clock.now();
        self.active.lock().insert(id, start.clone());
        Transaction {
            id,
            start,
            isolation,
            read_set: Vec::new(),
            write_set: BTreeMap::new(),
            closed: false,
        }
    }

    /// Read `key` as of the transaction's start. The transaction's own
    /// buffered writes are visible to itself.
    pub fn read(&self, tx: &mut Transaction, key: &str) -> Result<Option<Value>> {
        tx.ensure_open()?;

        if let Some(buffered) = tx.write_set.get(key) {
            return Ok(buffered.clone());
        }

        let chains = self.chains.read();
        let visible = chains.get(key).and_then(|chain| {
            chain
                .iter()
                .rev()
                .find(|version| version.ts <= tx.start)
        });

        let (ts, value) = match visible {
            Some(version) => (Some(version.ts.clone()), version.value.clone()),
            None => (None, None),
        };
        tx.read_set.push((key.to_string(), ts));
        Ok(value)
    }

    /// Buffer a write; invisible to other transactions until commit.
    pub fn write(&self, tx: &mut Transaction, key: &str, value: Value) -> Result<()> {
        tx.ensure_open()?;
        tx.write_set.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Buffer a deletion tombstone.
    pub fn delete(&self, tx: &mut Transaction, key: &str) -> Result<()> {
        tx.ensure_open()?;
        tx.write_set.insert(key.to_string(), None);
        Ok(())
    }

    /// Validate and apply the transaction.
    ///
    /// Under `repeatable_read` the commit aborts with
    /// [`MeshError::SerializationFailure`] when any read key gained a newer
    /// committed version; `serializable` additionally aborts with
    /// [`MeshError::WriteWriteConflict`] when a write key was committed by
    /// another transaction after this one started.
    pub fn commit(&self, tx: &mut Transaction) -> Result<HlcTimestamp> {
        tx.ensure_open()?;
        let _guard = self.commit_lock.lock();

        {
            let chains = self.chains.read();

            if tx.isolation != IsolationLevel::ReadCommitted {
                for (key, observed) in &tx.read_set {
                    let newest = chains
                        .get(key)
                        .and_then(|chain| chain.last())
                        .map(|v| (&v.ts, v.tx_id));
                    let changed = match (observed, newest) {
                        (Some(seen), Some((current, by))) => current > seen && by != tx.id,
                        (None, Some((_, by))) => by != tx.id,
                        _ => false,
                    };
                    if changed {
                        let key = key.clone();
                        self.close(tx);
                        return Err(MeshError::SerializationFailure(format!(
                            "key '{key}' changed after transaction start"
                        )));
                    }
                }
            }

            if tx.isolation == IsolationLevel::Serializable {
                for key in tx.write_set.keys() {
                    let raced = chains
                        .get(key)
                        .and_then(|chain| chain.last())
                        .map(|v| v.ts > tx.start && v.tx_id != tx.id)
                        .unwrap_or(false);
                    if raced {
                        let key = key.clone();
                        self.close(tx);
                        return Err(MeshError::WriteWriteConflict(key));
                    }
                }
            }
        }

        let commit_ts = self.clock.now();
        {
            let mut chains = self.chains.write();
            for (key, value) in std::mem::take(&mut tx.write_set) {
                chains.entry(key).or_default().push(Version {
                    ts: commit_ts.clone(),
                    tx_id: tx.id,
                    value,
                });
            }
        }
        self.close(tx);
        Ok(commit_ts)
    }

    /// Discard the transaction's buffered state.
    pub fn rollback(&self, tx: &mut Transaction) {
        tx.write_set.clear();
        tx.read_set.clear();
        self.close(tx);
    }

    fn close(&self, tx: &mut Transaction) {
        tx.closed = true;
        self.active.lock().remove(&tx.id);
    }

    /// Latest committed value outside any transaction.
    pub fn get_committed(&self, key: &str) -> Option<Value> {
        let chains = self.chains.read();
        chains
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|version| version.value.clone())
    }

    /// Drop versions no open transaction can still observe, keeping the
    /// newest version of every key and anything newer than the oldest
    /// active transaction start minus `retention_ns`.
    pub fn gc(&self, retention_ns: i64) -> usize {
        let horizon = {
            let active = self.active.lock();
            let oldest = active.values().min().cloned();
            match oldest {
                Some(ts) => ts.physical.saturating_sub(retention_ns),
                None => self.clock.now().physical.saturating_sub(retention_ns),
            }
        };

        let mut dropped = 0;
        let mut chains = self.chains.write();
        for chain in chains.values_mut() {
            if chain.len() <= 1 {
                continue;
            }
            let keep_from = chain
                .iter()
                .position(|v| v.ts.physical >= horizon)
                .unwrap_or(chain.len() - 1)
                .min(chain.len() - 1);
            dropped += keep_from;
            chain.drain(..keep_from);
        }
        dropped
    }

    /// Number of live versions across all keys.
    pub fn version_count(&self) -> usize {
        self.chains.read().values().map(|c| c.len()).sum()
    }
}
