use std::path::Path;

use chrono::Utc;

use crate::cli::RecordKind;
use crate::commands::common::{
    format_record_lines, list_records, open_store, record_to_list_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    kind: Option<RecordKind>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let records = list_records(&store, kind.map(Into::into), limit).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("Nothing here yet. Try `lectern add sermon <title>`.");
        return Ok(());
    }

    for line in format_record_lines(&records, Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}
