//! Append-only operation log.
//!
//! Every state mutation in the mesh lands here as a record keyed by
//! `(stream, timestamp)`, where the stream names the document, task, or
//! workspace the mutation belongs to. Payloads above the configured
//! threshold are gzip-compressed at rest. Reads run concurrently with
//! appends; garbage collection takes the write side exclusively.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{HlcTimestamp, HybridLogicalClock};
use crate::error::{MeshError, Result};

/// Log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Payloads at or above this many bytes are stored gzip-compressed
    pub compression_threshold: usize,
    /// Default durability mode for streams without an explicit override
    pub sync_writes: bool,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            sync_writes: false,
        }
    }
}

/// A single journaled mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: Uuid,
    /// Logical stream, e.g. `document:{id}` or `task:{id}`
    pub stream: String,
    pub agent_id: String,
    /// Type tag, e.g. `insert` or `state_update`
    pub kind: String,
    pub ts: HlcTimestamp,
    payload: Vec<u8>,
    compressed: bool,
}

impl OperationRecord {
    /// Decode the payload, decompressing transparently.
    pub fn payload(&self) -> Result<Value> {
        let bytes = if self.compressed {
            let mut decoder = GzDecoder::new(&self.payload[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| MeshError::Internal(format!("payload decompression failed: {e}")))?;
            out
        } else {
            self.payload.clone()
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| MeshError::Internal(format!("payload decode failed: {e}")))
    }

    pub fn stored_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OplogFilter {
    pub stream: Option<String>,
    pub agent_id: Option<String>,
    pub kind: Option<String>,
    pub from: Option<HlcTimestamp>,
    pub to: Option<HlcTimestamp>,
    pub limit: Option<usize>,
}

impl OplogFilter {
    pub fn for_stream(stream: impl Into<String>) -> Self {
        Self {
            stream: Some(stream.into()),
            ..Default::default()
        }
    }

    fn matches(&self, record: &OperationRecord) -> bool {
        if let Some(stream) = &self.stream {
            if &record.stream != stream {
                return false;
            }
        }
        if let Some(agent) = &self.agent_id {
            if &record.agent_id != agent {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &record.kind != kind {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if record.ts < *from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if record.ts > *to {
                return false;
            }
        }
        true
    }
}

/// Observable log counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OplogStats {
    pub appended: u64,
    pub compressed: u64,
    pub bytes_raw: u64,
    pub bytes_stored: u64,
    /// Appends accepted but not yet past the durability barrier
    pub queue_depth: u64,
    pub gc_runs: u64,
    pub gc_dropped: u64,
}

impl OplogStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_raw == 0 {
            1.0
        } else {
            self.bytes_stored as f64 / self.bytes_raw as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    compressed: AtomicU64,
    bytes_raw: AtomicU64,
    bytes_stored: AtomicU64,
    queue_depth: AtomicU64,
    gc_runs: AtomicU64,
    gc_dropped: AtomicU64,
}

type LogKey = (String, HlcTimestamp, Uuid);

/// The log. Cheap to clone and share.
#[derive(Clone)]
pub struct OperationLog {
    clock: Arc<HybridLogicalClock>,
    config: Arc<OplogConfig>,
    entries: Arc<RwLock<BTreeMap<LogKey, OperationRecord>>>,
    sync_streams: Arc<RwLock<HashSet<String>>>,
    counters: Arc<Counters>,
}

impl OperationLog {
    pub fn new(clock: Arc<HybridLogicalClock>, config: OplogConfig) -> Self {
        Self {
            clock,
            config: Arc::new(config),
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            sync_streams: Arc::new(RwLock::new(HashSet::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Opt a stream into synchronous durability regardless of the default.
    pub fn set_sync(&self, stream: impl Into<String>) {
        self.sync_streams.write().insert(stream.into());
    }

    fn is_sync(&self, stream: &str) -> bool {
        self.config.sync_writes || self.sync_streams.read().contains(stream)
    }

    /// Append a mutation. Assigns the record's timestamp from the local
    /// clock and compresses the payload above the configured threshold.
    /// Returns the stored record.
    pub fn append(
        &self,
        stream: impl Into<String>,
        agent_id: impl Into<String>,
        kind: impl Into<String>,
        payload: &Value,
    ) -> Result<OperationRecord> {
        let stream = stream.into();
        let raw = serde_json::to_vec(payload)
            .map_err(|e| MeshError::Internal(format!("payload encode failed: {e}")))?;

        let (bytes, compressed) = if raw.len() >= self.config.compression_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&raw)
                .and_then(|_| encoder.finish())
                .map(|out| (out, true))
                .map_err(|e| MeshError::Internal(format!("payload compression failed: {e}")))?
        } else {
            (raw.clone(), false)
        };

        let ts = self.clock.now();
        let record = OperationRecord {
            id: Uuid::new_v4(),
            stream: stream.clone(),
            agent_id: agent_id.into(),
            kind: kind.into(),
            ts: ts.clone(),
            payload: bytes,
            compressed,
        };

        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_raw
            .fetch_add(raw.len() as u64, Ordering::Relaxed);
        self.counters
            .bytes_stored
            .fetch_add(record.payload.len() as u64, Ordering::Relaxed);
        if compressed {
            self.counters.compressed.fetch_add(1, Ordering::Relaxed);
        }

        if !self.is_sync(&stream) {
            // Async mode defers the durability barrier; the entry is
            // indexed immediately so readers observe it.
            self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
        }

        self.entries
            .write()
            .insert((stream, ts, record.id), record.clone());

        Ok(record)
    }

    /// Acknowledge the durability barrier for deferred appends.
    pub fn flush(&self) -> u64 {
        self.counters.queue_depth.swap(0, Ordering::Relaxed)
    }

    /// All records matching the filter, in timestamp order.
    pub fn query(&self, filter: &OplogFilter) -> Vec<OperationRecord> {
        let entries = self.entries.read();
        let mut out: Vec<OperationRecord> = match &filter.stream {
            Some(stream) => {
                let lo = (stream.clone(), HlcTimestamp::zero(""), Uuid::nil());
                entries
                    .range(lo..)
                    .take_while(|((s, _, _), _)| s == stream)
                    .map(|(_, record)| record.clone())
                    .filter(|record| filter.matches(record))
                    .collect()
            }
            None => entries
                .values()
                .filter(|record| filter.matches(record))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| a.ts.cmp(&b.ts));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Stream matching records through a bounded channel. The producer
    /// stops promptly when `cancel` fires or the receiver is dropped.
    pub fn stream(
        &self,
        filter: OplogFilter,
        cancel: CancellationToken,
    ) -> tokio::sync::mpsc::Receiver<OperationRecord> {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let log = self.clone();
        tokio::spawn(async move {
            let records = log.query(&filter);
            for record in records {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(record) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }

    /// Drop records older than `before`, excluding protected streams
    /// (referenced snapshots). Returns the number of dropped records.
    pub fn gc(&self, before: &HlcTimestamp, protected: &HashSet<String>) -> usize {
        let mut entries = self.entries.write();
        let doomed: Vec<LogKey> = entries
            .iter()
            .filter(|((stream, ts, _), _)| ts < before && !protected.contains(stream))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        self.counters.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .gc_dropped
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> OplogStats {
        OplogStats {
            appended: self.counters.appended.load(Ordering::Relaxed),
            compressed: self.counters.compressed.load(Ordering::Relaxed),
            bytes_raw: self.counters.bytes_raw.load(Ordering::Relaxed),
            bytes_stored: self.counters.bytes_stored.load(Ordering::Relaxed),
            queue_depth: self.counters.queue_depth.load(Ordering::Relaxed),
            gc_runs: self.counters.gc_runs.load(Ordering::Relaxed),
            gc_dropped: self.counters.gc_dropped.load(Ordering::Relaxed),
        }
    }
}
