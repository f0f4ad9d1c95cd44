//! Concurrency-control strategies.
//!
//! A strategy drives three steps of every writing transaction, in order:
//! `begin` (backend transaction and tid), `vote` (conflict check, possibly
//! resolution) and `finish` (backend commit). Strategies are stateless and
//! shared by every transaction of a manager.

use crate::config::StrategyKind;
use crate::context::StrategyContext;
use crate::error::{CoreError, CoreResult, UnresolvableConflict};
use async_trait::async_trait;
use canopy_storage::{Oid, Record, Tid};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of the vote step.
#[derive(Debug, Clone)]
pub enum VoteOutcome {
    /// Safe to commit. `resolved` objects were merged with newer versions.
    Commit {
        /// Objects merged by a resolver.
        resolved: usize,
    },
    /// Objects written here were committed by someone else meanwhile.
    Overlap {
        /// Newest committed tid at vote time.
        tid: Tid,
        /// Objects written by both transactions.
        oids: Vec<Oid>,
    },
    /// A resolver refused to merge.
    Unresolvable(Box<UnresolvableConflict>),
}

impl VoteOutcome {
    /// A clean vote.
    pub const COMMIT: VoteOutcome = VoteOutcome::Commit { resolved: 0 };

    /// Returns true if the transaction may finish.
    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, VoteOutcome::Commit { .. })
    }

    /// Converts a failed vote into its error.
    pub fn into_result(self) -> CoreResult<()> {
        match self {
            VoteOutcome::Commit { .. } => Ok(()),
            VoteOutcome::Overlap { tid, oids } => Err(CoreError::Conflict { tid, oids }),
            VoteOutcome::Unresolvable(conflict) => Err(CoreError::Unresolvable(conflict)),
        }
    }
}

/// A pluggable begin/vote/finish policy.
#[async_trait]
pub trait TransactionStrategy: Send + Sync + fmt::Debug {
    /// Configuration name.
    fn name(&self) -> &'static str;

    /// Whether the backend should re-check serials at commit.
    fn verify_serials(&self) -> bool {
        true
    }

    /// Prepares a new transaction.
    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()>;

    /// Decides whether the stored writes may commit.
    async fn vote(&self, ctx: &mut StrategyContext) -> CoreResult<VoteOutcome>;

    /// Commits the backend transaction and returns the visible tid.
    async fn finish(&self, ctx: &mut StrategyContext) -> CoreResult<Tid> {
        ctx.commit_backend().await
    }

    /// Called before an existing object is first registered.
    ///
    /// Returns true if the object must be reloaded from storage first.
    async fn on_touch(&self, _ctx: &mut StrategyContext, _oid: &Oid) -> CoreResult<bool> {
        Ok(false)
    }
}

/// Builds the strategy for `kind`.
#[must_use]
pub fn strategy_for(kind: StrategyKind) -> Arc<dyn TransactionStrategy> {
    match kind {
        StrategyKind::None => Arc::new(NoneStrategy),
        StrategyKind::TidOnly => Arc::new(TidOnlyStrategy),
        StrategyKind::Simple => Arc::new(SimpleStrategy),
        StrategyKind::Resolve => Arc::new(ResolveStrategy::new(BeginMode::Full)),
        StrategyKind::ResolveReadCommitted => Arc::new(ResolveStrategy::new(BeginMode::Deferred)),
        StrategyKind::Transactionless => Arc::new(ResolveStrategy::new(BeginMode::TidOnly)),
        StrategyKind::Serializable => Arc::new(SerializableStrategy),
        StrategyKind::Lock => Arc::new(LockStrategy),
    }
}

async fn begin_full(ctx: &mut StrategyContext) -> CoreResult<()> {
    if ctx.is_writable() {
        ctx.open_backend(true).await?;
        ctx.take_tid().await?;
    }
    Ok(())
}

/// Records committed since the transaction began that it also modified.
///
/// A record whose tid equals the serial we loaded is the version we
/// started from, not a conflict.
async fn overlapping(ctx: &StrategyContext) -> CoreResult<Option<(Tid, Vec<Record>)>> {
    let current = ctx.storage().current_tid().await?;
    if current <= ctx.base_tid() {
        return Ok(None);
    }
    let conflicts = ctx
        .storage()
        .get_conflicts(ctx.base_tid(), ctx.tid())
        .await?;
    let overlap: Vec<Record> = conflicts
        .into_iter()
        .filter(|record| {
            ctx.modified()
                .get(&record.oid)
                .is_some_and(|ours| ours.serial() != Some(record.tid))
        })
        .collect();
    Ok((!overlap.is_empty()).then_some((current, overlap)))
}

/// No conflict detection at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneStrategy;

#[async_trait]
impl TransactionStrategy for NoneStrategy {
    fn name(&self) -> &'static str {
        StrategyKind::None.as_str()
    }

    fn verify_serials(&self) -> bool {
        false
    }

    async fn begin(&self, _ctx: &mut StrategyContext) -> CoreResult<()> {
        Ok(())
    }

    async fn vote(&self, _ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        Ok(VoteOutcome::COMMIT)
    }
}

/// Takes a tid at begin; no checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TidOnlyStrategy;

#[async_trait]
impl TransactionStrategy for TidOnlyStrategy {
    fn name(&self) -> &'static str {
        StrategyKind::TidOnly.as_str()
    }

    fn verify_serials(&self) -> bool {
        false
    }

    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()> {
        if ctx.is_writable() {
            ctx.take_tid().await?;
        }
        Ok(())
    }

    async fn vote(&self, _ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        Ok(VoteOutcome::COMMIT)
    }
}

/// Fails the vote when a modified object was committed concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleStrategy;

#[async_trait]
impl TransactionStrategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        StrategyKind::Simple.as_str()
    }

    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()> {
        begin_full(ctx).await
    }

    async fn vote(&self, ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        match overlapping(ctx).await? {
            None => Ok(VoteOutcome::COMMIT),
            Some((tid, records)) => {
                let oids: Vec<Oid> = records.into_iter().map(|r| r.oid).collect();
                warn!(
                    tid = ?ctx.tid(),
                    conflicted = %tid,
                    oids = ?oids,
                    "could not commit over concurrent writes"
                );
                Ok(VoteOutcome::Overlap { tid, oids })
            }
        }
    }
}

/// When the resolve family obtains its tid and backend transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginMode {
    /// Both at begin.
    Full,
    /// Both at the store phase.
    Deferred,
    /// Tid at begin, backend transaction at the store phase.
    TidOnly,
}

/// Merges concurrent writes field by field; fails only when a resolver
/// refuses.
#[derive(Debug, Clone, Copy)]
pub struct ResolveStrategy {
    mode: BeginMode,
}

impl ResolveStrategy {
    /// Creates the policy with the given begin behaviour.
    #[must_use]
    pub const fn new(mode: BeginMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl TransactionStrategy for ResolveStrategy {
    fn name(&self) -> &'static str {
        match self.mode {
            BeginMode::Full => StrategyKind::Resolve.as_str(),
            BeginMode::Deferred => StrategyKind::ResolveReadCommitted.as_str(),
            BeginMode::TidOnly => StrategyKind::Transactionless.as_str(),
        }
    }

    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()> {
        match self.mode {
            BeginMode::Full => begin_full(ctx).await,
            BeginMode::Deferred => Ok(()),
            BeginMode::TidOnly => {
                if ctx.is_writable() {
                    ctx.take_tid().await?;
                }
                Ok(())
            }
        }
    }

    async fn vote(&self, ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        let Some((current, records)) = overlapping(ctx).await? else {
            return Ok(VoteOutcome::COMMIT);
        };
        let tids: Vec<Tid> = records.iter().map(|r| r.tid).collect();
        for record in records {
            let Some(ours) = ctx.modified().get(&record.oid).cloned() else {
                continue;
            };
            let theirs = ctx.registry().decode(&record)?;
            let resolver = ctx.registry().resolver(ours.type_tag());
            match resolver.resolve(&ours, theirs) {
                Ok(merged) => {
                    ctx.write(&merged, Some(record.tid)).await?;
                    ctx.replace_modified(merged);
                }
                Err(conflict) => {
                    warn!(
                        tid = ?ctx.tid(),
                        conflicted = %record.tid,
                        current = %current,
                        conflict = %conflict,
                        "could not resolve conflict"
                    );
                    return Ok(VoteOutcome::Unresolvable(Box::new(conflict)));
                }
            }
        }
        info!(tid = ?ctx.tid(), conflicted = ?tids, "resolved conflicts");
        Ok(VoteOutcome::Commit {
            resolved: tids.len(),
        })
    }
}

/// Trusts the backend's serial verification; never votes no.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializableStrategy;

#[async_trait]
impl TransactionStrategy for SerializableStrategy {
    fn name(&self) -> &'static str {
        StrategyKind::Serializable.as_str()
    }

    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()> {
        begin_full(ctx).await
    }

    async fn vote(&self, _ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        Ok(VoteOutcome::COMMIT)
    }
}

/// Pessimistic locking: each object is locked on first touch and reloaded
/// once the lock is held.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockStrategy;

#[async_trait]
impl TransactionStrategy for LockStrategy {
    fn name(&self) -> &'static str {
        StrategyKind::Lock.as_str()
    }

    async fn begin(&self, ctx: &mut StrategyContext) -> CoreResult<()> {
        if ctx.is_writable() {
            ctx.take_tid().await?;
        }
        Ok(())
    }

    async fn vote(&self, _ctx: &mut StrategyContext) -> CoreResult<VoteOutcome> {
        Ok(VoteOutcome::COMMIT)
    }

    async fn finish(&self, ctx: &mut StrategyContext) -> CoreResult<Tid> {
        let result = ctx.commit_backend().await;
        ctx.release_locks();
        result
    }

    async fn on_touch(&self, ctx: &mut StrategyContext, oid: &Oid) -> CoreResult<bool> {
        if ctx.holds_lock(oid) {
            return Ok(false);
        }
        ctx.lock(oid).await?;
        debug!(oid = %oid, "object locked for transaction");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_kinds() {
        for kind in StrategyKind::ALL {
            assert_eq!(strategy_for(kind).name(), kind.as_str());
        }
    }

    #[test]
    fn verification_policy() {
        assert!(!strategy_for(StrategyKind::None).verify_serials());
        assert!(!strategy_for(StrategyKind::TidOnly).verify_serials());
        assert!(strategy_for(StrategyKind::Resolve).verify_serials());
        assert!(strategy_for(StrategyKind::Lock).verify_serials());
    }

    #[test]
    fn outcome_into_result() {
        assert!(VoteOutcome::COMMIT.into_result().is_ok());
        let err = VoteOutcome::Overlap {
            tid: Tid::new(4),
            oids: vec![Oid::root()],
        }
        .into_result()
        .unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert!(err.is_retryable());
    }
}
