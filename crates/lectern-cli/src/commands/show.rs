use std::path::Path;

use chrono::Utc;
use lectern_core::models::{Content, EntityRecord, EntityType, Sermon, SermonStatus, Series};
use lectern_core::SyncStore;
use serde::Serialize;

use crate::commands::common::{
    conflict_to_item, format_relative_time, format_sync_timestamp, normalize_identifier,
    open_store, record_title, resolve_record, short_id, ConflictItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct RecordDetail<'a> {
    record: &'a EntityRecord,
    pending_conflict: Option<ConflictItem>,
}

pub async fn run_show(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_identifier(id)?;
    let store = open_store(db_path).await?;
    let record = resolve_record(&normalized_id, &store, true).await?;
    let pending_conflict = store
        .pending_conflict_for(&record.id)
        .await?
        .map(|conflict| conflict_to_item(&conflict));

    if as_json {
        let detail = RecordDetail {
            record: &record,
            pending_conflict,
        };
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    for line in format_record_detail(&record, &store, pending_conflict.as_ref()).await? {
        println!("{line}");
    }
    Ok(())
}

async fn format_record_detail(
    record: &EntityRecord,
    store: &SyncStore,
    conflict: Option<&ConflictItem>,
) -> Result<Vec<String>, CliError> {
    let now_ms = Utc::now().timestamp_millis();
    let mut lines = vec![
        format!("id:        {}", record.id),
        format!("kind:      {}", record.entity_type),
        format!("title:     {}", record_title(record)),
    ];

    match record.entity_type {
        EntityType::Sermon => {
            let sermon = Sermon::from_fields(&record.fields)?;
            let series = match record.parent_id {
                Some(parent_id) => match store.get_any(&parent_id).await? {
                    Some(parent) => {
                        format!("{} ({})", short_id(&parent_id.as_str()), record_title(&parent))
                    }
                    None => format!("{} (not on this device)", short_id(&parent_id.as_str())),
                },
                None => "-".to_string(),
            };
            lines.push(format!("series:    {series}"));
            lines.push(format!("status:    {}", status_label(sermon.status)));
            if !sermon.tags.is_empty() {
                let tags = sermon
                    .tags
                    .iter()
                    .map(|tag| format!("#{tag}"))
                    .collect::<Vec<_>>();
                lines.push(format!("tags:      {}", tags.join(" ")));
            }
            if let Some(preached_on) = sermon.preached_on {
                lines.push(format!("preached:  {preached_on}"));
            }
            push_timestamps(&mut lines, record, now_ms, conflict);
            if !sermon.body.is_empty() {
                lines.push(String::new());
                lines.push(sermon.body);
            }
        }
        EntityType::Series => {
            let series = Series::from_fields(&record.fields)?;
            let sermons = store.list_children(&record.id).await?.len();
            lines.push(format!("sermons:   {sermons}"));
            push_timestamps(&mut lines, record, now_ms, conflict);
            if !series.description.is_empty() {
                lines.push(String::new());
                lines.push(series.description);
            }
        }
    }
    Ok(lines)
}

fn push_timestamps(
    lines: &mut Vec<String>,
    record: &EntityRecord,
    now_ms: i64,
    conflict: Option<&ConflictItem>,
) {
    lines.push(format!("created:   {}", format_sync_timestamp(record.created_at)));
    lines.push(format!(
        "updated:   {} ({})",
        format_sync_timestamp(record.updated_at),
        format_relative_time(record.updated_at, now_ms)
    ));
    if let Some(deleted_at) = record.deleted_at {
        lines.push(format!("deleted:   {}", format_sync_timestamp(deleted_at)));
    }
    lines.push(format!("sync:      {}", describe_sync_state(record)));
    if let Some(conflict) = conflict {
        lines.push(format!(
            "conflict:  {} on {}",
            short_id(&conflict.id),
            conflict.conflicting_fields.join(", ")
        ));
    }
}

pub fn describe_sync_state(record: &EntityRecord) -> String {
    if record.blocked {
        format!(
            "blocked (local v{}, acked v{}); run `lectern sync unblock`",
            record.sync_version, record.acked_version
        )
    } else if record.acked_version == 0 {
        "never synced".to_string()
    } else if record.dirty {
        format!(
            "unsynced changes (local v{}, acked v{})",
            record.sync_version, record.acked_version
        )
    } else {
        format!("synced at v{}", record.acked_version)
    }
}

pub const fn status_label(status: SermonStatus) -> &'static str {
    match status {
        SermonStatus::Draft => "draft",
        SermonStatus::Ready => "ready",
        SermonStatus::Preached => "preached",
        SermonStatus::Archived => "archived",
    }
}
