//! Two-phase commit across shards.
//!
//! The coordinator logs the participant list before asking anyone to
//! prepare and logs its decision before telling anyone about it. A
//! coordinator rebuilt from the same log finishes every transaction it
//! finds: undecided ones abort, decided ones get their logged decision
//! relayed again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tessera_log::SharedLog;
use tessera_routing::ShardId;
use tessera_shard::{FailPoints, LogicalClock, SessionInfo, ShardError, Timestamp};
use tracing::{info, warn};

use crate::error::ClusterError;
use crate::registry::ShardRegistry;

pub const FAIL_BEFORE_DECISION: &str = "hangBeforeWritingDecision";
pub const FAIL_BEFORE_DELIVERY: &str = "hangBeforeSendingDecision";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitDecision {
    Commit { commit_ts: Timestamp },
    Abort { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorRecord {
    Participants {
        session: SessionInfo,
        participants: Vec<ShardId>,
    },
    Decision {
        session: SessionInfo,
        decision: CommitDecision,
    },
    Done {
        session: SessionInfo,
    },
}

impl CoordinatorRecord {
    fn session(&self) -> SessionInfo {
        match self {
            CoordinatorRecord::Participants { session, .. }
            | CoordinatorRecord::Decision { session, .. }
            | CoordinatorRecord::Done { session } => *session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Aborting,
    Done,
}

impl CoordinatorState {
    fn can_transition(self, to: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, to),
            (Active, Preparing)
                | (Active, Aborting)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Prepared, Aborting)
                | (Committing, Done)
                | (Aborting, Done)
        )
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct TransactionCoordinator {
    registry: Arc<ShardRegistry>,
    clock: Arc<LogicalClock>,
    failpoints: Arc<FailPoints>,
    log: SharedLog<CoordinatorRecord>,
    states: Mutex<HashMap<SessionInfo, CoordinatorState>>,
}

impl TransactionCoordinator {
    pub fn new(
        registry: Arc<ShardRegistry>,
        clock: Arc<LogicalClock>,
        failpoints: Arc<FailPoints>,
        log: SharedLog<CoordinatorRecord>,
    ) -> Self {
        Self {
            registry,
            clock,
            failpoints,
            log,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Where `session` stands. Finished transactions are forgotten, so
    /// only in-flight ones report a state.
    pub fn state(&self, session: &SessionInfo) -> Option<CoordinatorState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session)
            .copied()
    }

    fn transition(&self, session: SessionInfo, to: CoordinatorState) -> Result<(), ClusterError> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let from = states.get(&session).copied().unwrap_or(CoordinatorState::Active);
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(ClusterError::IllegalStateTransition {
                machine: "transaction coordinator",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        states.insert(session, to);
        Ok(())
    }

    /// Run two-phase commit for `session` over `participants`. Returns the
    /// decision that was applied.
    pub fn coordinate(
        &self,
        session: SessionInfo,
        participants: &[ShardId],
    ) -> Result<CommitDecision, ClusterError> {
        self.transition(session, CoordinatorState::Preparing)?;
        self.log.append(&CoordinatorRecord::Participants {
            session,
            participants: participants.to_vec(),
        })?;

        let mut max_prepare = None;
        let mut failure: Option<(ShardId, ShardError)> = None;
        for id in participants {
            match self.registry.get(id)?.prepare_transaction(session) {
                Ok(ts) => max_prepare = max_prepare.max(Some(ts)),
                Err(e) => {
                    warn!(txn = session.txn_number, shard = %id, error = %e, "participant failed to prepare");
                    failure = Some((id.clone(), e));
                    break;
                }
            }
        }

        let decision = match (failure, max_prepare) {
            (None, Some(ts)) => {
                self.transition(session, CoordinatorState::Prepared)?;
                if self.failpoints.should_fail(FAIL_BEFORE_DECISION) {
                    return Err(ClusterError::FailPoint(FAIL_BEFORE_DECISION.into()));
                }
                self.clock.advance(ts);
                CommitDecision::Commit {
                    commit_ts: self.clock.tick(),
                }
            }
            (Some((shard, e)), _) => CommitDecision::Abort {
                reason: format!("{shard} failed to prepare: {e}"),
            },
            (None, None) => CommitDecision::Abort {
                reason: "no participants".into(),
            },
        };

        self.log.append(&CoordinatorRecord::Decision {
            session,
            decision: decision.clone(),
        })?;
        info!(txn = session.txn_number, lsid = %session.lsid_string(), decision = ?decision,
            participants = participants.len(), "coordinator decided");
        if self.failpoints.should_fail(FAIL_BEFORE_DELIVERY) {
            return Err(ClusterError::FailPoint(FAIL_BEFORE_DELIVERY.into()));
        }
        self.deliver(session, participants, &decision)?;
        Ok(decision)
    }

    fn deliver(
        &self,
        session: SessionInfo,
        participants: &[ShardId],
        decision: &CommitDecision,
    ) -> Result<(), ClusterError> {
        let next = match decision {
            CommitDecision::Commit { .. } => CoordinatorState::Committing,
            CommitDecision::Abort { .. } => CoordinatorState::Aborting,
        };
        self.transition(session, next)?;
        for id in participants {
            let shard = self.registry.get(id)?;
            match decision {
                CommitDecision::Commit { commit_ts } => {
                    shard.commit_transaction(session, Some(*commit_ts))?
                }
                CommitDecision::Abort { .. } => shard.abort_transaction(session, true)?,
            }
        }
        self.log.append(&CoordinatorRecord::Done { session })?;
        self.transition(session, CoordinatorState::Done)?;
        self.forget(session);
        self.compact()?;
        Ok(())
    }

    /// Drop the state of a transaction whose outcome is durable and
    /// acknowledged by every participant.
    fn forget(&self, session: SessionInfo) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session);
    }

    /// Drop finished transactions from the log.
    fn compact(&self) -> Result<(), ClusterError> {
        let records = self.log.replay()?;
        let done: Vec<SessionInfo> = records
            .iter()
            .filter_map(|r| match r {
                CoordinatorRecord::Done { session } => Some(*session),
                _ => None,
            })
            .collect();
        if done.is_empty() {
            return Ok(());
        }
        let live: Vec<CoordinatorRecord> = records
            .into_iter()
            .filter(|r| !done.contains(&r.session()))
            .collect();
        self.log.rewrite(&live)?;
        Ok(())
    }

    /// Finish every transaction left in the log by a previous coordinator.
    pub fn recover(&self) -> Result<Vec<(SessionInfo, CommitDecision)>, ClusterError> {
        let mut pending: BTreeMap<SessionInfo, (Vec<ShardId>, Option<CommitDecision>, bool)> =
            BTreeMap::new();
        for record in self.log.replay()? {
            let entry = pending
                .entry(record.session())
                .or_insert_with(|| (Vec::new(), None, false));
            match record {
                CoordinatorRecord::Participants { participants, .. } => entry.0 = participants,
                CoordinatorRecord::Decision { decision, .. } => entry.1 = Some(decision),
                CoordinatorRecord::Done { .. } => entry.2 = true,
            }
        }

        let mut recovered = Vec::new();
        for (session, (participants, decision, done)) in pending {
            if done {
                continue;
            }
            let decision = match decision {
                Some(d) => {
                    self.transition(session, CoordinatorState::Preparing)?;
                    self.transition(session, CoordinatorState::Prepared)?;
                    d
                }
                None => {
                    let d = CommitDecision::Abort {
                        reason: "coordinator restarted before deciding".into(),
                    };
                    self.log.append(&CoordinatorRecord::Decision {
                        session,
                        decision: d.clone(),
                    })?;
                    d
                }
            };
            info!(txn = session.txn_number, lsid = %session.lsid_string(), decision = ?decision,
                "recovering transaction");
            self.deliver(session, &participants, &decision)?;
            recovered.push((session, decision));
        }
        self.compact()?;
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_rejects_skips() {
        use CoordinatorState::*;
        assert!(Active.can_transition(Preparing));
        assert!(Prepared.can_transition(Aborting));
        assert!(!Active.can_transition(Committing));
        assert!(!Done.can_transition(Aborting));
        assert!(!Committing.can_transition(Aborting));
    }
}
