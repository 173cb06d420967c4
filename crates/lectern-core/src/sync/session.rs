//! A single sync session.
//!
//! Pushes every entity type's pending operations, then pulls and reconciles
//! remote changes per type. Transient gateway failures defer the affected
//! type to the next session; authentication and protocol failures abort
//! the session. No local lock is held across a gateway call.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::models::{
    coalesce, ConflictSummary, EntityRecord, EntityType, OperationEntry, OperationStatus,
    RecordId, RecordSnapshot, SyncConflict,
};
use crate::services::{ApplyOutcome, ConflictWrite, LocalApply, SyncStore};
use crate::sync::reconcile::{conflicting_fields, reconcile, Reconciliation};
use crate::sync::{
    AccessToken, ConflictPolicy, FailedOperation, GatewayError, PolicyDecision, PullBatch,
    PullRequest, PushOutcome, PushRequest, RemoteGateway, SyncError, SyncPhase, SyncReport,
    SyncResult,
};

/// Attempts to apply a reconciliation while the record keeps changing locally
const MAX_APPLY_ATTEMPTS: usize = 3;
/// Version conflicts tolerated per record before it waits for the next session
const MAX_VERSION_CONFLICTS: u32 = 2;

/// Phase tracking and cancellation shared between the engine and its session.
pub(crate) struct SessionControl {
    phase: RwLock<SyncPhase>,
    cancel: watch::Sender<bool>,
}

impl SessionControl {
    pub(crate) fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            phase: RwLock::new(SyncPhase::Idle),
            cancel,
        }
    }

    pub(crate) fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        let mut current = self.phase.write();
        if *current != phase {
            tracing::debug!("Sync phase {} -> {}", *current, phase);
            *current = phase;
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub(crate) fn reset(&self) {
        self.cancel.send_replace(false);
    }

    pub(crate) fn check_cancelled(&self) -> SyncResult<()> {
        if *self.cancel.borrow() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn cancelled(&self) {
        let mut receiver = self.cancel.subscribe();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run a gateway call bounded by `timeout` and interruptible by cancel.
    async fn call<T, F>(&self, timeout: Duration, call: F) -> SyncResult<Result<T, GatewayError>>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        self.check_cancelled()?;
        tokio::select! {
            () = self.cancelled() => Err(SyncError::Cancelled),
            outcome = tokio::time::timeout(timeout, call) => {
                Ok(outcome.unwrap_or(Err(GatewayError::Timeout)))
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> SyncResult<()> {
        tokio::select! {
            () = self.cancelled() => Err(SyncError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

enum PushStep {
    Settled,
    /// Entry left pending for a later session
    Unsettled,
    /// Transient failure; stop pushing this type
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteEffect {
    Skipped,
    Applied,
    /// Conflict left pending for manual resolution
    Deferred,
    /// Local record kept changing; try again next session
    Contended,
}

struct Plan {
    change: Option<LocalApply>,
    conflict: Option<ConflictWrite>,
    detected: Option<ConflictSummary>,
    effect: RemoteEffect,
}

impl Plan {
    const fn apply(change: LocalApply) -> Self {
        Self {
            change: Some(change),
            conflict: None,
            detected: None,
            effect: RemoteEffect::Applied,
        }
    }
}

pub(crate) struct SyncSession<'a> {
    store: &'a SyncStore,
    gateway: &'a dyn RemoteGateway,
    policy: &'a dyn ConflictPolicy,
    config: &'a SyncConfig,
    control: &'a SessionControl,
    token: AccessToken,
    report: SyncReport,
    version_conflicts: HashMap<RecordId, u32>,
}

impl<'a> SyncSession<'a> {
    pub(crate) fn new(
        store: &'a SyncStore,
        gateway: &'a dyn RemoteGateway,
        policy: &'a dyn ConflictPolicy,
        config: &'a SyncConfig,
        control: &'a SessionControl,
        token: AccessToken,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
            config,
            control,
            token,
            report: SyncReport::default(),
            version_conflicts: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) -> SyncResult<SyncReport> {
        for entity_type in EntityType::ALL {
            self.push_type(entity_type).await?;
        }
        for entity_type in EntityType::ALL {
            self.pull_type(entity_type).await?;
        }
        Ok(self.report)
    }

    // --- Push ------------------------------------------------------------

    async fn push_type(&mut self, entity_type: EntityType) -> SyncResult<()> {
        self.control.set_phase(SyncPhase::Pushing);
        let mut after_seq = 0;
        let mut drained = true;

        'batches: loop {
            self.control.check_cancelled()?;
            let claimed = self
                .store
                .claim_pending(entity_type, after_seq, self.config.push_batch_size)
                .await?;
            if claimed.is_empty() {
                break;
            }
            after_seq = claimed.iter().map(|entry| entry.seq).max().unwrap_or(after_seq);

            let (latest, superseded) = coalesce(claimed);
            for entry in &superseded {
                self.store.complete(&entry.id).await?;
            }

            let mut queue = latest.into_iter();
            while let Some(entry) = queue.next() {
                if self.version_conflicts.get(&entry.entity_id).copied().unwrap_or(0)
                    >= MAX_VERSION_CONFLICTS
                {
                    self.store.release(&entry.id).await?;
                    drained = false;
                    continue;
                }

                match self.push_entry(&entry).await? {
                    PushStep::Settled => {}
                    PushStep::Unsettled => drained = false,
                    PushStep::Stop => {
                        for rest in queue.by_ref() {
                            self.store.release(&rest.id).await?;
                        }
                        tracing::info!("Deferring {entity_type} push to the next session");
                        self.report.defer(entity_type);
                        drained = false;
                        break 'batches;
                    }
                }
            }
        }

        if drained {
            self.store
                .advance_pushed(entity_type, self.store.now())
                .await?;
        }
        Ok(())
    }

    async fn push_entry(&mut self, entry: &OperationEntry) -> SyncResult<PushStep> {
        let Some(record) = self.store.get_any(&entry.entity_id).await? else {
            tracing::warn!("Dropping operation {} for a record that no longer exists", entry.id);
            self.store.complete(&entry.id).await?;
            return Ok(PushStep::Settled);
        };
        if let Err(reason) = record.check_invariants() {
            self.quarantine(&record, &reason).await?;
            self.store.release(&entry.id).await?;
            return Ok(PushStep::Unsettled);
        }

        let request = PushRequest {
            operation_id: entry.id.clone(),
            entity_type: entry.entity_type,
            record: entry.payload.clone(),
            expected_version: record.acked_version,
        };
        let outcome = self
            .control
            .call(
                self.config.request_timeout,
                self.gateway.push(&self.token, &request),
            )
            .await?;

        match outcome {
            Ok(PushOutcome::Accepted {
                version,
                updated_at,
            }) => {
                self.store
                    .acknowledge_push(entry, version, updated_at)
                    .await?;
                self.report.pushed += 1;
                tracing::debug!(
                    "Pushed {} {} as version {version}",
                    entry.entity_type,
                    entry.entity_id
                );
                Ok(PushStep::Settled)
            }
            Ok(PushOutcome::VersionConflict { current }) => {
                if current.id != entry.entity_id || current.entity_type != entry.entity_type {
                    return Err(SyncError::Protocol(format!(
                        "version conflict for {} returned {} {}",
                        entry.entity_id, current.entity_type, current.id
                    )));
                }
                tracing::debug!(
                    "Version conflict pushing {}: remote is at version {}",
                    entry.id,
                    current.version
                );
                *self.version_conflicts.entry(entry.entity_id).or_insert(0) += 1;

                let effect = self.reconcile_remote(current).await?;
                // No-op when reconciliation superseded the entry
                self.store.release(&entry.id).await?;
                Ok(if effect == RemoteEffect::Applied {
                    PushStep::Settled
                } else {
                    PushStep::Unsettled
                })
            }
            Err(error) if error.is_transient() => {
                self.record_failure(entry, &error, false).await?;
                Ok(PushStep::Stop)
            }
            Err(error @ GatewayError::Rejected(_)) => {
                tracing::warn!("Remote store rejected operation {}: {error}", entry.id);
                self.record_failure(entry, &error, true).await?;
                Ok(PushStep::Unsettled)
            }
            Err(GatewayError::Unauthorized(message)) => Err(SyncError::Authentication(message)),
            Err(error) => Err(SyncError::Protocol(error.to_string())),
        }
    }

    async fn record_failure(
        &mut self,
        entry: &OperationEntry,
        error: &GatewayError,
        always_report: bool,
    ) -> SyncResult<()> {
        let message = error.to_string();
        let status = self.store.fail(&entry.id, &message).await?;
        let exhausted = status == OperationStatus::Failed;
        if exhausted || always_report {
            self.report.failed_operations.push(FailedOperation {
                operation_id: entry.id.clone(),
                entity_type: entry.entity_type,
                entity_id: entry.entity_id,
                error: message,
                retry_count: entry.retry_count.saturating_add(1),
                exhausted,
            });
        }
        Ok(())
    }

    async fn quarantine(&mut self, record: &EntityRecord, reason: &str) -> SyncResult<()> {
        self.store.block_record(&record.id, reason).await?;
        if !self.report.blocked_records.contains(&record.id) {
            self.report.blocked_records.push(record.id);
        }
        Ok(())
    }

    // --- Pull ------------------------------------------------------------

    async fn pull_type(&mut self, entity_type: EntityType) -> SyncResult<()> {
        let cursor = self.store.cursor(entity_type).await?;
        let mut since = cursor.last_pulled;
        let mut highest = since;
        let mut contended = false;
        let mut finished = false;

        loop {
            self.control.check_cancelled()?;
            self.control.set_phase(SyncPhase::Pulling);
            let request = PullRequest {
                entity_type,
                since,
                limit: self.config.pull_batch_size,
            };
            let Some(batch) = self.pull_page(&request).await? else {
                break;
            };
            if let Some(foreign) = batch
                .records
                .iter()
                .find(|record| record.entity_type != entity_type)
            {
                return Err(SyncError::Protocol(format!(
                    "{entity_type} changes included {} {}",
                    foreign.entity_type, foreign.id
                )));
            }

            self.control.set_phase(SyncPhase::Reconciling);
            for remote in batch.records {
                self.control.check_cancelled()?;
                highest = highest.max(remote.position());
                match self.reconcile_remote(remote).await? {
                    RemoteEffect::Applied => self.report.pulled += 1,
                    RemoteEffect::Contended => contended = true,
                    RemoteEffect::Skipped | RemoteEffect::Deferred => {}
                }
            }
            highest = highest.max(batch.next_cursor);

            if !batch.has_more {
                finished = true;
                break;
            }
            if batch.next_cursor <= since {
                return Err(SyncError::Protocol(format!(
                    "{entity_type} change feed did not advance past {since:?}"
                )));
            }
            since = batch.next_cursor;
        }

        // The cursor moves once per complete pass and never past contended records
        if finished && !contended {
            self.store.advance_pulled(entity_type, highest).await?;
        } else {
            self.report.defer(entity_type);
        }
        Ok(())
    }

    async fn pull_page(&self, request: &PullRequest) -> SyncResult<Option<PullBatch>> {
        let mut attempts = 0;
        loop {
            let outcome = self
                .control
                .call(
                    self.config.request_timeout,
                    self.gateway.pull(&self.token, request),
                )
                .await?;
            match outcome {
                Ok(batch) => return Ok(Some(batch)),
                Err(error) if error.is_transient() => {
                    attempts += 1;
                    if self.config.retry.is_exhausted(attempts) {
                        tracing::warn!(
                            "Pull of {} failed after {attempts} attempts: {error}",
                            request.entity_type
                        );
                        return Ok(None);
                    }
                    let delay = self.config.retry.delay_for_attempt(attempts);
                    tracing::debug!(
                        "Pull of {} failed, retrying in {delay:?}: {error}",
                        request.entity_type
                    );
                    self.control.sleep(delay).await?;
                }
                Err(GatewayError::Unauthorized(message)) => {
                    return Err(SyncError::Authentication(message));
                }
                Err(error) => return Err(SyncError::Protocol(error.to_string())),
            }
        }
    }

    // --- Reconcile -------------------------------------------------------

    /// Fold one remote snapshot into local state.
    async fn reconcile_remote(&mut self, remote: RecordSnapshot) -> SyncResult<RemoteEffect> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let local = self.store.get_any(&remote.id).await?;
            if let Some(local) = &local {
                if local.blocked {
                    tracing::debug!("Skipping quarantined record {}", local.id);
                    return Ok(RemoteEffect::Skipped);
                }
                if local.entity_type != remote.entity_type {
                    return Err(SyncError::Protocol(format!(
                        "record {} is a {} locally but a {} remotely",
                        remote.id, local.entity_type, remote.entity_type
                    )));
                }
                if let Err(reason) = local.check_invariants() {
                    self.quarantine(local, &reason).await?;
                    return Ok(RemoteEffect::Skipped);
                }
            }

            let pending = self.store.pending_conflict_for(&remote.id).await?;
            let plan = match pending {
                Some(pending) => refresh_conflict(pending, local.as_ref(), &remote),
                None => self.plan(local.as_ref(), &remote),
            };
            let Some(plan) = plan else {
                return Ok(RemoteEffect::Skipped);
            };

            let expected_version = local.as_ref().map(|record| record.sync_version);
            let outcome = self
                .store
                .apply_reconciliation(&remote.id, expected_version, plan.change, plan.conflict)
                .await?;
            match outcome {
                ApplyOutcome::Applied(_) => {
                    if let Some(summary) = plan.detected {
                        self.report.conflicts.push(summary);
                    }
                    return Ok(plan.effect);
                }
                ApplyOutcome::Stale => {
                    tracing::debug!("Record {} changed during reconciliation, retrying", remote.id);
                }
            }
        }

        tracing::warn!(
            "Record {} kept changing during reconciliation; retrying next session",
            remote.id
        );
        Ok(RemoteEffect::Contended)
    }

    fn plan(&self, local: Option<&EntityRecord>, remote: &RecordSnapshot) -> Option<Plan> {
        match reconcile(local, remote) {
            Reconciliation::Skip => None,
            Reconciliation::Adopt => Some(Plan::apply(LocalApply::Adopt(remote.clone()))),
            Reconciliation::Merge(merged) => {
                tracing::debug!("Merged disjoint edits on {} {}", remote.entity_type, remote.id);
                Some(Plan::apply(LocalApply::Rebase {
                    content: merged,
                    remote: remote.clone(),
                }))
            }
            Reconciliation::Conflict { fields, local } => {
                let now = self.store.now();
                let decision = self.policy.decide(&local, remote, &fields);
                tracing::info!(
                    "Conflict on {} {} ({}): {} decided {decision:?}",
                    remote.entity_type,
                    remote.id,
                    fields.iter().cloned().collect::<Vec<_>>().join(", "),
                    self.policy.name()
                );

                let change = match decision {
                    PolicyDecision::LocalWins => Some(LocalApply::Rebase {
                        content: local.clone(),
                        remote: remote.clone(),
                    }),
                    PolicyDecision::RemoteWins => Some(LocalApply::Adopt(remote.clone())),
                    PolicyDecision::Defer => None,
                };
                let mut conflict =
                    SyncConflict::new(local, remote.clone(), fields, self.policy.name(), now);
                if let Some(resolution) = decision.resolution() {
                    conflict = conflict.resolved(resolution, now);
                }
                let effect = if change.is_some() {
                    RemoteEffect::Applied
                } else {
                    RemoteEffect::Deferred
                };

                Some(Plan {
                    change,
                    detected: Some(conflict.summary()),
                    conflict: Some(ConflictWrite::Insert(conflict)),
                    effect,
                })
            }
        }
    }
}

/// Point a pending conflict at a newer remote snapshot.
fn refresh_conflict(
    mut pending: SyncConflict,
    local: Option<&EntityRecord>,
    remote: &RecordSnapshot,
) -> Option<Plan> {
    if remote.version <= pending.remote_snapshot.version {
        return None;
    }
    tracing::debug!(
        "Refreshing pending conflict {} with remote version {}",
        pending.id,
        remote.version
    );
    pending.remote_snapshot = remote.clone();
    if let Some(local) = local {
        pending.local_snapshot = local.snapshot();
        let fields = conflicting_fields(local, remote);
        if !fields.is_empty() {
            pending.conflicting_fields = fields;
        }
    }
    Some(Plan {
        change: None,
        conflict: Some(ConflictWrite::Update(pending)),
        detected: None,
        effect: RemoteEffect::Deferred,
    })
}
