use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use lectern_core::db::RecordQuery;
use lectern_core::models::{ConflictId, EntityRecord, EntityType, SyncConflict};
use lectern_core::sync::{
    policy_from_name, HttpGateway, StaticCredentialProvider, SyncPhase, SyncStatus,
};
use lectern_core::{RecordId, SyncConfig, SyncEngine, SyncStore};
use serde::Serialize;

use crate::config::{CliConfig, ENV_TOKEN};
use crate::error::CliError;

const SHORT_ID_LEN: usize = 13;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: EntityType,
    pub title: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub dirty: bool,
    pub blocked: bool,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub conflicting_fields: Vec<String>,
    pub local_updated_at: i64,
    pub remote_updated_at: i64,
    pub detected_at: String,
    pub strategy: String,
}

pub async fn open_store(db_path: &Path) -> Result<SyncStore, CliError> {
    Ok(SyncStore::open_path(db_path).await?)
}

pub async fn list_records(
    store: &SyncStore,
    kind: Option<EntityType>,
    limit: usize,
) -> Result<Vec<EntityRecord>, CliError> {
    let query = RecordQuery {
        entity_type: kind,
        include_deleted: false,
        limit,
        offset: 0,
    };
    Ok(store.list(&query).await?)
}

/// Resolve a full record id or a unique prefix of one.
///
/// Tombstones only resolve when `include_deleted` is set.
pub async fn resolve_record(
    record_query: &str,
    store: &SyncStore,
    include_deleted: bool,
) -> Result<EntityRecord, CliError> {
    let fetch = |id: RecordId| async move {
        let record = store.get_any(&id).await?;
        Ok::<_, CliError>(record.filter(|record| include_deleted || !record.is_tombstone()))
    };

    if let Ok(record_id) = record_query.parse::<RecordId>() {
        if let Some(record) = fetch(record_id).await? {
            return Ok(record);
        }
    }

    let matching_ids = store.find_ids_by_prefix(record_query).await?;
    match matching_ids.as_slice() {
        [] => Err(CliError::RecordNotFound(record_query.to_string())),
        [id] => fetch(*id)
            .await?
            .ok_or_else(|| CliError::RecordNotFound(record_query.to_string())),
        _ => {
            let options = matching_ids
                .iter()
                .take(3)
                .map(|id| short_id(&id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{record_query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Resolve a pending conflict by full id or unique prefix.
pub async fn resolve_pending_conflict(
    conflict_query: &str,
    store: &SyncStore,
) -> Result<SyncConflict, CliError> {
    if let Ok(conflict_id) = conflict_query.parse::<ConflictId>() {
        if let Some(conflict) = store.conflict(&conflict_id).await? {
            return Ok(conflict);
        }
    }

    let mut matches = store
        .list_pending_conflicts(None)
        .await?
        .into_iter()
        .filter(|conflict| conflict.id.as_str().starts_with(conflict_query))
        .collect::<Vec<_>>();

    match matches.len() {
        0 => Err(CliError::ConflictNotFound(conflict_query.to_string())),
        1 => Ok(matches.remove(0)),
        _ => {
            let options = matches
                .iter()
                .take(3)
                .map(|conflict| short_id(&conflict.id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "Conflict prefix '{conflict_query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Sync status computed from the local store alone.
pub async fn local_sync_status(store: &SyncStore) -> Result<SyncStatus, CliError> {
    let counts = store.operation_counts().await?;
    Ok(SyncStatus {
        phase: SyncPhase::Idle,
        last_sync_at: store.last_sync_at().await?,
        pending_operations: counts.pending + counts.in_flight,
        failed_operations: counts.failed,
        pending_conflicts: store.count_pending_conflicts().await?,
        blocked_records: store.blocked_records().await?.len(),
        last_error: None,
    })
}

/// Build an engine talking to the configured HTTP backend.
pub fn build_engine(store: SyncStore, config: &CliConfig) -> Result<SyncEngine, CliError> {
    let settings = config.sync_settings(env::var(ENV_TOKEN).ok())?;
    let policy = policy_from_name(config.policy_name()).ok_or_else(|| {
        CliError::Config(format!("Unknown conflict policy '{}'", config.policy_name()))
    })?;
    let gateway = HttpGateway::new(settings.api_base_url)
        .map_err(|error| CliError::Config(error.to_string()))?;

    tracing::debug!("Syncing with {} using {}", gateway.base_url(), policy.name());
    Ok(SyncEngine::new(
        store,
        Arc::new(gateway),
        Arc::new(StaticCredentialProvider::new(settings.token)),
        SyncConfig::default(),
    )
    .with_policy(policy))
}

pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

pub fn record_title(record: &EntityRecord) -> &str {
    record
        .fields
        .get("title")
        .and_then(|value| value.as_str())
        .unwrap_or("")
}

pub fn record_preview(record: &EntityRecord, max_chars: usize) -> String {
    let collapsed = record_title(record)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let collapsed = if collapsed.is_empty() {
        "(untitled)".to_string()
    } else {
        collapsed
    };

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub const fn sync_marker(record: &EntityRecord) -> &'static str {
    if record.blocked {
        "blocked"
    } else if record.dirty {
        "unsynced"
    } else {
        ""
    }
}

pub fn format_record_lines(records: &[EntityRecord], now_ms: i64) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let short = short_id(&record.id.as_str());
            let kind = record.entity_type.as_str();
            let preview = record_preview(record, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let line = format!(
                "{short:<13}  {kind:<6}  {preview:<40}  {relative_time:<10}  {}",
                sync_marker(record)
            );
            line.trim_end().to_string()
        })
        .collect()
}

pub fn record_to_list_item(record: &EntityRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.to_string(),
        kind: record.entity_type,
        title: record_title(record).to_string(),
        parent_id: record.parent_id.map(|id| id.to_string()),
        created_at: record.created_at,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        dirty: record.dirty,
        blocked: record.blocked,
    }
}

pub fn conflict_to_item(conflict: &SyncConflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id.to_string(),
        entity_type: conflict.entity_type,
        entity_id: conflict.entity_id.to_string(),
        conflicting_fields: conflict.conflicting_fields.iter().cloned().collect(),
        local_updated_at: conflict.local_snapshot.updated_at,
        remote_updated_at: conflict.remote_snapshot.updated_at,
        detected_at: format_sync_timestamp(conflict.created_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let fields = conflict
                .conflicting_fields
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "{}  {}  {:<6}  record={}  fields={}",
                short_id(&conflict.id.as_str()),
                format_sync_timestamp(conflict.created_at),
                conflict.entity_type.as_str(),
                short_id(&conflict.entity_id.as_str()),
                fields
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

pub fn normalize_content(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Join positional title words and reject blank titles.
pub fn normalize_title(parts: &[String]) -> Result<String, CliError> {
    let joined = parts.join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(collapsed)
    }
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyRecordId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_content(&buffer))
}

pub fn capture_editor_input_with_initial(
    initial_content: &str,
    extension: &str,
) -> Result<Option<String>, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_file_path(extension);
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let edited = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(normalize_content(&edited))
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let mut command = Command::new(program);
            command.args(parts).arg(file_path);

            let status = command.status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

pub fn create_temp_file_path(extension: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!(
        "lectern-edit-{}-{now}.{extension}",
        std::process::id()
    ))
}

/// `--db-path`, then config/env, then the platform data directory.
pub fn resolve_db_path(
    cli_db_path: Option<PathBuf>,
    config: &CliConfig,
) -> Result<PathBuf, CliError> {
    match cli_db_path.or_else(|| config.db_path.clone()) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("lectern").join("lectern.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve data directory".into()))
}
