//! Sync Engine: runs sessions against a Remote Gateway.
//!
//! At most one session runs at a time. A trigger that arrives while a
//! session is running joins it and receives the same outcome.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::models::{
    ConflictId, EntityRecord, EntityType, RecordId, RecordSnapshot, Resolution, SyncConflict,
};
use crate::services::SyncStore;
use crate::sync::session::{SessionControl, SyncSession};
use crate::sync::{
    ConflictPolicy, CredentialProvider, LastWriteWins, RemoteGateway, SyncError, SyncPhase,
    SyncReport, SyncResult, SyncStatus,
};

type SessionOutcome = Option<SyncResult<SyncReport>>;
type SessionSlot = Option<watch::Receiver<SessionOutcome>>;

enum Role {
    Leader(watch::Sender<SessionOutcome>),
    Follower(watch::Receiver<SessionOutcome>),
}

/// Clears the running-session slot when the leading trigger finishes or is dropped.
struct SlotGuard<'a>(&'a Mutex<SessionSlot>);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

pub struct SyncEngine {
    store: SyncStore,
    gateway: Arc<dyn RemoteGateway>,
    credentials: Arc<dyn CredentialProvider>,
    policy: Arc<dyn ConflictPolicy>,
    config: SyncConfig,
    control: SessionControl,
    last_error: RwLock<Option<String>>,
    running: Mutex<SessionSlot>,
}

impl SyncEngine {
    /// Create an engine using last-write-wins conflict resolution.
    pub fn new(
        store: SyncStore,
        gateway: Arc<dyn RemoteGateway>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let store = store.with_retry_policy(config.retry);
        Self {
            store,
            gateway,
            credentials,
            policy: Arc::new(LastWriteWins),
            config,
            control: SessionControl::new(),
            last_error: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Replace the conflict policy.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub const fn store(&self) -> &SyncStore {
        &self.store
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn phase(&self) -> SyncPhase {
        self.control.phase()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Cancel the running session, if any.
    ///
    /// Completed operations stay completed; the rest return to pending.
    pub fn cancel(&self) {
        let slot = self.running.lock();
        if slot.is_some() {
            tracing::info!("Cancelling sync session");
            self.control.cancel();
        }
    }

    /// Run a sync session, or join the one already running.
    pub async fn trigger_sync(&self) -> SyncResult<SyncReport> {
        match self.claim() {
            Role::Follower(mut receiver) => {
                tracing::debug!("Sync already running, waiting for its outcome");
                let outcome = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| (*outcome).clone());
                match outcome {
                    Ok(Some(result)) => result,
                    _ => Err(SyncError::Cancelled),
                }
            }
            Role::Leader(sender) => {
                let _slot = SlotGuard(&self.running);
                let result = self.run_session().await;
                sender.send_replace(Some(result.clone()));
                result
            }
        }
    }

    /// Join the running session or start a new one.
    ///
    /// The cancel flag is cleared under the slot lock, so a `cancel` that
    /// sees the new session is never undone by its start.
    fn claim(&self) -> Role {
        let mut slot = self.running.lock();
        if let Some(receiver) = slot.as_ref() {
            Role::Follower(receiver.clone())
        } else {
            let (sender, receiver) = watch::channel(None);
            self.control.reset();
            *slot = Some(receiver);
            Role::Leader(sender)
        }
    }

    async fn run_session(&self) -> SyncResult<SyncReport> {
        let started_at = self.store.now();
        tracing::info!("Sync session started via {} gateway", self.gateway.name());

        match self.execute(started_at).await {
            Ok(report) => {
                *self.last_error.write() = None;
                self.control.set_phase(SyncPhase::Idle);
                tracing::info!(
                    "Sync session finished: {} pushed, {} pulled, {} conflicts, {} failed",
                    report.pushed,
                    report.pulled,
                    report.conflicts.len(),
                    report.failed_operations.len()
                );
                Ok(report)
            }
            Err(error) => {
                self.control.set_phase(SyncPhase::Failed);
                if error == SyncError::Cancelled {
                    tracing::info!("Sync session cancelled");
                } else {
                    tracing::error!("Sync session failed: {error}");
                }
                *self.last_error.write() = Some(error.to_string());
                if let Err(release_error) = self.store.release_in_flight().await {
                    tracing::warn!("Failed to release in-flight operations: {release_error}");
                }
                self.control.set_phase(SyncPhase::Idle);
                Err(error)
            }
        }
    }

    async fn execute(&self, started_at: i64) -> SyncResult<SyncReport> {
        let token = self
            .credentials
            .credential()
            .await
            .map_err(|error| SyncError::Authentication(error.to_string()))?;

        // Leases left behind by an interrupted session
        self.store.release_in_flight().await?;

        let session = SyncSession::new(
            &self.store,
            self.gateway.as_ref(),
            self.policy.as_ref(),
            &self.config,
            &self.control,
            token,
        );
        let mut report = session.run().await?;

        let finished_at = self.store.now();
        self.store.set_last_sync_at(finished_at).await?;
        match self
            .store
            .compact(self.config.tombstone_retention, self.config.completed_retention)
            .await
        {
            Ok(stats) => report.compaction = stats,
            Err(error) => tracing::warn!("Compaction after sync failed: {error}"),
        }

        report.started_at = started_at;
        report.finished_at = finished_at;
        Ok(report)
    }

    /// Pending conflicts, optionally of one type, oldest first.
    pub async fn list_pending_conflicts(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<SyncConflict>> {
        self.store.list_pending_conflicts(entity_type).await
    }

    /// Resolve a pending conflict; see [`SyncStore::resolve_conflict`].
    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged: Option<RecordSnapshot>,
    ) -> Result<EntityRecord> {
        self.store.resolve_conflict(id, resolution, merged).await
    }

    /// Give failed operations another retry budget.
    pub async fn requeue_failed(&self, entity_id: Option<&RecordId>) -> Result<u64> {
        self.store.requeue_failed(entity_id).await
    }

    /// Lift quarantine from a record and re-enqueue it.
    pub async fn unblock_record(&self, id: &RecordId) -> Result<EntityRecord> {
        self.store.unblock_record(id).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let counts = self.store.operation_counts().await?;
        Ok(SyncStatus {
            phase: self.phase(),
            last_sync_at: self.store.last_sync_at().await?,
            pending_operations: counts.pending + counts.in_flight,
            failed_operations: counts.failed,
            pending_conflicts: self.store.count_pending_conflicts().await?,
            blocked_records: self.store.blocked_records().await?.len(),
            last_error: self.last_error.read().clone(),
        })
    }
}
