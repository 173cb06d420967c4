use std::path::{Path, PathBuf};

use lectern_core::models::{FieldMap, RecordSnapshot, Resolution, SyncConflict};
use lectern_core::sync::SyncStatus;
use lectern_core::SyncReport;

use crate::cli::ResolutionArg;
use crate::commands::common::{
    build_engine, conflict_to_item, format_conflict_lines, format_sync_timestamp,
    local_sync_status, normalize_identifier, open_store, resolve_pending_conflict,
    resolve_record, short_id, ConflictItem,
};
use crate::config::CliConfig;
use crate::error::CliError;

pub async fn run_sync(config: &CliConfig, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let engine = build_engine(store, config)?;

    let session = engine.trigger_sync();
    tokio::pin!(session);
    let report = tokio::select! {
        result = &mut session => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling sync; unfinished work stays queued...");
            engine.cancel();
            session.await?
        }
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_report_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Sync completed: pushed {}, pulled {}",
        report.pushed, report.pulled
    )];

    for conflict in &report.conflicts {
        let outcome = conflict
            .resolution
            .map_or("pending", Resolution::as_str);
        lines.push(format!(
            "  conflict {} on {} {} ({}): {}",
            short_id(&conflict.id.as_str()),
            conflict.entity_type,
            short_id(&conflict.entity_id.as_str()),
            conflict.conflicting_fields.join(", "),
            outcome
        ));
    }
    for failed in &report.failed_operations {
        let state = if failed.exhausted {
            "gave up"
        } else {
            "will retry"
        };
        lines.push(format!(
            "  failed {} {} after {} attempts ({state}): {}",
            failed.entity_type,
            short_id(&failed.entity_id.as_str()),
            failed.retry_count,
            failed.error
        ));
    }
    if !report.deferred_entity_types.is_empty() {
        let deferred = report
            .deferred_entity_types
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("  deferred to next sync: {deferred}"));
    }
    for blocked in &report.blocked_records {
        lines.push(format!(
            "  quarantined record {}; see `lectern sync unblock`",
            short_id(&blocked.as_str())
        ));
    }
    let compaction = report.compaction;
    if compaction.operations_deleted > 0 || compaction.tombstones_purged > 0 {
        lines.push(format!(
            "  compacted {} log entries and {} tombstones",
            compaction.operations_deleted, compaction.tombstones_purged
        ));
    }
    lines
}

pub async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let status = local_sync_status(&store).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let last_sync = status
        .last_sync_at
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    let mut lines = vec![
        format!("Last sync:          {last_sync}"),
        format!("Pending operations: {}", status.pending_operations),
        format!("Failed operations:  {}", status.failed_operations),
        format!("Pending conflicts:  {}", status.pending_conflicts),
        format!("Blocked records:    {}", status.blocked_records),
    ];
    if let Some(error) = &status.last_error {
        lines.push(format!("Last error:         {error}"));
    }
    lines
}

pub async fn run_sync_conflicts(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = store.list_pending_conflicts(None).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No pending sync conflicts.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_resolve(
    id: &str,
    resolution: ResolutionArg,
    merged_file: Option<PathBuf>,
    db_path: &Path,
) -> Result<(), CliError> {
    let normalized_id = normalize_identifier(id)?;
    let store = open_store(db_path).await?;
    let conflict = resolve_pending_conflict(&normalized_id, &store).await?;
    let resolution = Resolution::from(resolution);

    let merged = match (resolution, merged_file) {
        (Resolution::Merged, Some(path)) => {
            let raw = std::fs::read_to_string(&path)?;
            Some(merged_snapshot(&conflict, &raw)?)
        }
        (Resolution::Merged, None) => {
            return Err(CliError::InvalidArgument(
                "--use merged needs --merged-file".into(),
            ));
        }
        (_, Some(_)) => {
            return Err(CliError::InvalidArgument(
                "--merged-file only applies to --use merged".into(),
            ));
        }
        (_, None) => None,
    };

    let record = store.resolve_conflict(&conflict.id, resolution, merged).await?;
    println!(
        "Resolved {} as {}; record {} {}",
        short_id(&conflict.id.as_str()),
        resolution.as_str(),
        record.id,
        if record.dirty {
            "will be pushed on the next sync"
        } else {
            "matches the remote copy"
        }
    );
    Ok(())
}

/// Build the merged snapshot from a JSON object of domain fields.
pub fn merged_snapshot(conflict: &SyncConflict, raw: &str) -> Result<RecordSnapshot, CliError> {
    let fields: FieldMap = serde_json::from_str(raw).map_err(|error| {
        CliError::InvalidArgument(format!("merged file must hold a JSON object: {error}"))
    })?;
    let mut snapshot = conflict.local_snapshot.clone();
    snapshot.fields = fields;
    Ok(snapshot)
}

pub async fn run_sync_requeue(id: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let entity_id = match id {
        Some(id) => {
            let normalized_id = normalize_identifier(id)?;
            Some(resolve_record(&normalized_id, &store, true).await?.id)
        }
        None => None,
    };

    let requeued = store.requeue_failed(entity_id.as_ref()).await?;
    println!("Requeued {requeued} failed operations");
    Ok(())
}

pub async fn run_sync_unblock(id: &str, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_identifier(id)?;
    let store = open_store(db_path).await?;
    let record = resolve_record(&normalized_id, &store, true).await?;
    if !record.blocked {
        return Err(CliError::InvalidArgument(format!(
            "record {} is not quarantined",
            record.id
        )));
    }

    let released = store.unblock_record(&record.id).await?;
    println!("{}", released.id);
    Ok(())
}
