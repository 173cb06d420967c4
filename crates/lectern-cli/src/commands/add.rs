use std::path::Path;

use lectern_core::models::{EntityType, Sermon, Series};
use lectern_core::{RecordId, SyncStore};

use crate::cli::AddCommands;
use crate::commands::common::{
    normalize_identifier, normalize_title, open_store, read_piped_stdin, resolve_record,
};
use crate::config::CliConfig;
use crate::error::CliError;

pub async fn run_add(
    command: AddCommands,
    config: &CliConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;

    let record = match command {
        AddCommands::Sermon {
            title,
            body,
            tags,
            series,
        } => {
            let title = normalize_title(&title)?;
            let body = match body {
                Some(body) => body,
                None => read_piped_stdin()?.unwrap_or_default(),
            };
            let parent_id = match series {
                Some(series) => Some(resolve_series_id(&series, &store).await?),
                None => None,
            };
            let sermon = Sermon::new(title).with_body(body).with_tags(tags);
            store
                .create_content(config.owner_id(), parent_id, &sermon)
                .await?
        }
        AddCommands::Series { title, description } => {
            let mut series = Series::new(normalize_title(&title)?);
            series.description = description.unwrap_or_default().trim().to_string();
            store.create_content(config.owner_id(), None, &series).await?
        }
    };

    println!("{}", record.id);
    Ok(())
}

/// Resolve an id or prefix that must name a live series.
pub async fn resolve_series_id(
    query: &str,
    store: &SyncStore,
) -> Result<RecordId, CliError> {
    let query = normalize_identifier(query)?;
    let record = resolve_record(&query, store, false).await?;
    if record.entity_type != EntityType::Series {
        return Err(CliError::InvalidArgument(format!(
            "{} is a {}, not a series",
            record.id, record.entity_type
        )));
    }
    Ok(record.id)
}
