use std::path::Path;

use lectern_core::services::soft_delete_cascade;

use crate::commands::common::{normalize_identifier, open_store, resolve_record};
use crate::error::CliError;

pub async fn run_delete(id: &str, cascade: bool, db_path: &Path) -> Result<(), CliError> {
    let normalized_id = normalize_identifier(id)?;
    let store = open_store(db_path).await?;
    let record = resolve_record(&normalized_id, &store, false).await?;

    if cascade {
        for deleted in soft_delete_cascade(&store, &record.id).await? {
            println!("{deleted}");
        }
    } else {
        let deleted = store.soft_delete(&record.id).await?;
        println!("{}", deleted.id);
    }
    Ok(())
}
