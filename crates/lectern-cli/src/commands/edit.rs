use std::path::Path;

use lectern_core::models::{normalize_tags, Content, EntityRecord, EntityType, Sermon, Series};
use lectern_core::SyncStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cli::StatusArg;
use crate::commands::add::resolve_series_id;
use crate::commands::common::{
    capture_editor_input_with_initial, normalize_identifier, open_store, read_piped_stdin,
    resolve_record,
};
use crate::error::CliError;

/// Field changes requested on the command line.
#[derive(Debug, Default)]
pub struct EditPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<StatusArg>,
    pub series: Option<String>,
}

impl EditPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.body.is_none()
            && self.description.is_none()
            && self.tags.is_empty()
            && self.status.is_none()
            && self.series.is_none()
    }
}

pub async fn run_edit(id: &str, patch: EditPatch, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_identifier(id)?;
    let store = open_store(db_path).await?;
    let record = resolve_record(&normalized_id, &store, false).await?;

    let changed = if patch.is_empty() {
        match record.entity_type {
            EntityType::Sermon => edit_in_editor::<Sermon>(&record, &store).await?,
            EntityType::Series => edit_in_editor::<Series>(&record, &store).await?,
        }
    } else {
        apply_patch(&record, patch, &store).await?
    };

    if !changed {
        tracing::debug!("No changes to {}", record.id);
    }
    println!("{}", record.id);
    Ok(())
}

async fn apply_patch(
    record: &EntityRecord,
    mut patch: EditPatch,
    store: &SyncStore,
) -> Result<bool, CliError> {
    if patch.body.as_deref() == Some("-") {
        patch.body = Some(read_piped_stdin()?.unwrap_or_default());
    }

    let changed = match record.entity_type {
        EntityType::Sermon => {
            if patch.description.is_some() {
                return Err(CliError::InvalidArgument(
                    "--description only applies to a series".into(),
                ));
            }
            let current = Sermon::from_fields(&record.fields)?;
            let updated = patch_sermon(current.clone(), &patch)?;
            let content_changed = updated != current;
            if content_changed {
                store.update_content(&record.id, &updated).await?;
            }

            let parent_changed = match patch.series.as_deref() {
                Some(series) => {
                    let parent_id = if series.trim().eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(resolve_series_id(series, store).await?)
                    };
                    if parent_id == record.parent_id {
                        false
                    } else {
                        store.set_parent(&record.id, parent_id).await?;
                        true
                    }
                }
                None => false,
            };
            content_changed || parent_changed
        }
        EntityType::Series => {
            if patch.body.is_some()
                || !patch.tags.is_empty()
                || patch.status.is_some()
                || patch.series.is_some()
            {
                return Err(CliError::InvalidArgument(
                    "--body, --tag, --status and --series only apply to a sermon".into(),
                ));
            }
            let current = Series::from_fields(&record.fields)?;
            let mut updated = current.clone();
            if let Some(title) = &patch.title {
                updated.title = non_empty_title(title)?;
            }
            if let Some(description) = &patch.description {
                updated.description = description.trim().to_string();
            }
            let changed = updated != current;
            if changed {
                store.update_content(&record.id, &updated).await?;
            }
            changed
        }
    };
    Ok(changed)
}

/// Apply command-line edits to a sermon.
pub fn patch_sermon(mut sermon: Sermon, patch: &EditPatch) -> Result<Sermon, CliError> {
    if let Some(title) = &patch.title {
        sermon.title = non_empty_title(title)?;
    }
    if let Some(body) = &patch.body {
        sermon.body.clone_from(body);
    }
    if !patch.tags.is_empty() {
        sermon.tags = normalize_tags(&patch.tags);
    }
    if let Some(status) = patch.status {
        sermon.status = status.into();
    }
    Ok(sermon)
}

fn non_empty_title(title: &str) -> Result<String, CliError> {
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(title)
    }
}

/// Open the typed content as JSON in the editor and save what comes back.
async fn edit_in_editor<C>(record: &EntityRecord, store: &SyncStore) -> Result<bool, CliError>
where
    C: Content + Serialize + DeserializeOwned + PartialEq,
{
    let current = C::from_fields(&record.fields)?;
    let initial = serde_json::to_string_pretty(&current)?;

    let Some(edited) = capture_editor_input_with_initial(&initial, "json")? else {
        return Err(CliError::EmptyEditedContent);
    };
    let updated = parse_edited_content::<C>(&edited)?;
    if updated == current {
        return Ok(false);
    }

    store.update_content(&record.id, &updated).await?;
    Ok(true)
}

pub fn parse_edited_content<C: DeserializeOwned>(edited: &str) -> Result<C, CliError> {
    let value: serde_json::Value = serde_json::from_str(edited)?;
    let title_missing = value
        .get("title")
        .and_then(serde_json::Value::as_str)
        .is_none_or(|title| title.trim().is_empty());
    if title_missing {
        return Err(CliError::EmptyTitle);
    }
    Ok(serde_json::from_value(value)?)
}
