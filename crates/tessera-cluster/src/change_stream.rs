//! Change streams: one ordered feed of a namespace's user writes, merged
//! from every shard that held it.
//!
//! A poll only reads up to the cluster's frontier, the oldest watermark
//! among all shards. Nothing at or below it can still appear on any
//! shard, so events are released in a total order that never goes back.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bson::{Document, doc};
use tessera_routing::{Namespace, ShardId};
use tessera_shard::{OpKind, OpTime, OplogEntry, SessionInfo, Timestamp};
use tracing::debug;

use crate::config_server::ConfigServer;
use crate::error::ClusterError;
use crate::hex;
use crate::registry::ShardRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Position of an event in the merged stream: commit time, then shard,
/// then position within the shard's commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken {
    pub ts: Timestamp,
    pub shard: ShardId,
    pub index: u32,
}

impl Ord for ResumeToken {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ts, &self.shard, self.index).cmp(&(other.ts, &other.shard, other.index))
    }
}

impl PartialOrd for ResumeToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{}",
            self.ts.as_u64(),
            self.index,
            hex(self.shard.as_str().as_bytes())
        )
    }
}

impl FromStr for ResumeToken {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClusterError::InvalidResumeToken(s.to_string());
        if s.len() < 24 || s.len() % 2 != 0 || !s.is_ascii() {
            return Err(invalid());
        }
        let ts = u64::from_str_radix(&s[..16], 16).map_err(|_| invalid())?;
        let index = u32::from_str_radix(&s[16..24], 16).map_err(|_| invalid())?;
        let shard = (24..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| invalid())?;
        let shard = String::from_utf8(shard).map_err(|_| invalid())?;
        if shard.is_empty() {
            return Err(invalid());
        }
        Ok(ResumeToken {
            ts: Timestamp::from_u64(ts),
            shard: ShardId::new(shard),
            index,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Invalidate,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Invalidate => "invalidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub operation: OperationType,
    pub ns: Namespace,
    pub document_key: Option<Document>,
    /// Post-image for inserts, updates and replacements.
    pub full_document: Option<Document>,
    pub cluster_time: Timestamp,
    pub txn: Option<SessionInfo>,
}

impl ChangeEvent {
    fn from_entry(shard: &ShardId, entry: &OplogEntry) -> Result<Self, ClusterError> {
        let operation = match entry.kind {
            OpKind::Insert => OperationType::Insert,
            OpKind::Update => OperationType::Update,
            OpKind::Replace => OperationType::Replace,
            OpKind::Delete => OperationType::Delete,
            OpKind::Drop => OperationType::Drop,
        };
        Ok(ChangeEvent {
            token: ResumeToken {
                ts: entry.optime.ts,
                shard: shard.clone(),
                index: entry.optime.index,
            },
            operation,
            ns: entry.ns.clone(),
            document_key: entry.document_key()?,
            full_document: entry.document()?,
            cluster_time: entry.optime.ts,
            txn: entry.txn,
        })
    }

    fn invalidate(after: &ChangeEvent) -> Self {
        ChangeEvent {
            token: ResumeToken {
                index: after.token.index.saturating_add(1),
                ..after.token.clone()
            },
            operation: OperationType::Invalidate,
            ns: after.ns.clone(),
            document_key: None,
            full_document: None,
            cluster_time: after.cluster_time,
            txn: None,
        }
    }

    /// Event in its wire shape.
    pub fn to_document(&self) -> Document {
        let mut out = doc! {
            "_id": self.token.to_string(),
            "operationType": self.operation.as_str(),
            "ns": { "db": self.ns.db(), "coll": self.ns.coll() },
            "clusterTime": self.cluster_time.to_bson(),
        };
        if let Some(key) = &self.document_key {
            out.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.full_document {
            out.insert("fullDocument", full.clone());
        }
        if let Some(txn) = &self.txn {
            out.insert("lsid", txn.lsid_string());
            out.insert("txnNumber", txn.txn_number);
        }
        out
    }
}

/// Where a stream begins.
#[derive(Debug, Clone)]
enum Start {
    /// Events committed after this time.
    At(Timestamp),
    /// Events ordered after this token.
    After(ResumeToken),
}

impl Start {
    fn ts(&self) -> Timestamp {
        match self {
            Start::At(ts) => *ts,
            Start::After(token) => token.ts,
        }
    }

    /// The exclusive read position on `shard` equivalent to this start.
    fn position(&self, shard: &ShardId) -> OpTime {
        match self {
            Start::At(ts) => OpTime::end_of(*ts),
            Start::After(token) => match shard.cmp(&token.shard) {
                Ordering::Less => OpTime::end_of(token.ts),
                Ordering::Equal => OpTime::new(token.ts, token.index),
                Ordering::Greater => OpTime::end_of(token.ts.prev()),
            },
        }
    }
}

pub struct ChangeStream {
    config: Arc<ConfigServer>,
    registry: Arc<ShardRegistry>,
    ns: Namespace,
    start: Start,
    positions: BTreeMap<ShardId, OpTime>,
    pending: VecDeque<ChangeEvent>,
    last: Option<ResumeToken>,
    closed: bool,
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("ns", &self.ns)
            .field("start", &self.start)
            .field("pending", &self.pending.len())
            .field("last", &self.last)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ChangeStream {
    pub(crate) fn open(
        config: Arc<ConfigServer>,
        registry: Arc<ShardRegistry>,
        ns: Namespace,
        resume_after: Option<ResumeToken>,
        now: Timestamp,
    ) -> Self {
        let start = match &resume_after {
            Some(token) => Start::After(token.clone()),
            None => Start::At(now),
        };
        debug!(ns = %ns, start = ?start, "opened change stream");
        Self {
            config,
            registry,
            ns,
            start,
            positions: BTreeMap::new(),
            pending: VecDeque::new(),
            last: resume_after,
            closed: false,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Token of the last event handed out, usable to resume after it.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.last.clone()
    }

    /// True once an invalidate has been returned.
    pub fn is_closed(&self) -> bool {
        self.closed && self.pending.is_empty()
    }

    /// Oldest time any shard could still commit at or before.
    fn frontier(&self) -> Timestamp {
        self.registry
            .all()
            .map(|s| s.watermark())
            .min()
            .unwrap_or(Timestamp::ZERO)
    }

    /// Read every shard up to the frontier and queue the merged events.
    fn poll(&mut self) -> Result<(), ClusterError> {
        if self.closed {
            return Ok(());
        }
        let frontier = self.frontier();
        let shards = self.config.shards_since(&self.ns, self.start.ts())?;
        let mut events = Vec::new();
        for id in shards {
            let after = *self
                .positions
                .entry(id.clone())
                .or_insert_with(|| self.start.position(&id));
            if OpTime::end_of(frontier) <= after {
                continue;
            }
            let shard = self.registry.get(&id)?;
            for entry in shard.read_oplog(after, frontier, Some(&self.ns))? {
                if !entry.from_migrate {
                    events.push(ChangeEvent::from_entry(&id, &entry)?);
                }
            }
            self.positions.insert(id, OpTime::end_of(frontier));
        }
        events.sort_by(|a, b| a.token.cmp(&b.token));
        for event in events {
            let dropped = event.operation == OperationType::Drop;
            let invalidate = dropped.then(|| ChangeEvent::invalidate(&event));
            self.pending.push_back(event);
            if let Some(invalidate) = invalidate {
                self.pending.push_back(invalidate);
                self.closed = true;
                debug!(ns = %self.ns, "change stream invalidated by drop");
                break;
            }
        }
        Ok(())
    }

    /// Next event if one is available now.
    pub fn try_next(&mut self) -> Result<Option<ChangeEvent>, ClusterError> {
        if self.pending.is_empty() {
            self.poll()?;
        }
        let event = self.pending.pop_front();
        if let Some(e) = &event {
            self.last = Some(e.token.clone());
        }
        Ok(event)
    }

    /// Every event available now.
    pub fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, ClusterError> {
        self.poll()?;
        let batch: Vec<ChangeEvent> = self.pending.drain(..).collect();
        if let Some(e) = batch.last() {
            self.last = Some(e.token.clone());
        }
        Ok(batch)
    }

    /// Wait up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<ChangeEvent>, ClusterError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_next()? {
                return Ok(Some(event));
            }
            if self.is_closed() || Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(secs: u32, shard: &str, index: u32) -> ResumeToken {
        ResumeToken {
            ts: Timestamp::new(secs, 1),
            shard: ShardId::new(shard),
            index,
        }
    }

    #[test]
    fn tokens_order_by_time_then_shard_then_index() {
        assert!(token(1, "shard1", 9) < token(2, "shard0", 0));
        assert!(token(2, "shard0", 9) < token(2, "shard1", 0));
        assert!(token(2, "shard1", 0) < token(2, "shard1", 1));
    }

    #[test]
    fn token_text_parses_back() {
        let t = token(1700000000, "shard-a", 3);
        let parsed: ResumeToken = t.to_string().parse().unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for bad in ["", "zz", "0000000000000001000000", "00000000000000010000000g73"] {
            let err = bad.parse::<ResumeToken>().unwrap_err();
            assert!(matches!(err, ClusterError::InvalidResumeToken(_)), "{bad}");
        }
    }

    #[test]
    fn resume_positions_respect_shard_order() {
        let start = Start::After(token(5, "shard1", 2));
        let ts = Timestamp::new(5, 1);
        assert_eq!(start.position(&ShardId::new("shard0")), OpTime::end_of(ts));
        assert_eq!(start.position(&ShardId::new("shard1")), OpTime::new(ts, 2));
        assert_eq!(start.position(&ShardId::new("shard2")), OpTime::end_of(ts.prev()));
    }
}
