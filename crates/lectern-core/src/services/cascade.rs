//! Explicit cascading soft-delete.
//!
//! Parent references are plain lookup keys; deleting a series never touches
//! its sermons unless a caller opts in through this policy.

use crate::error::Result;
use crate::models::RecordId;
use crate::services::SyncStore;

/// Soft-delete a record and every live record whose parent it is.
///
/// Each deletion is its own local write with its own tombstone and
/// operation. Returns the ids deleted, children first.
pub async fn soft_delete_cascade(store: &SyncStore, id: &RecordId) -> Result<Vec<RecordId>> {
    let parent = store.get(id).await?;
    let mut deleted = Vec::new();

    for child in store.list_children(&parent.id).await? {
        store.soft_delete(&child.id).await?;
        deleted.push(child.id);
    }
    store.soft_delete(&parent.id).await?;
    deleted.push(parent.id);

    tracing::info!(
        "Cascade-deleted {} {} and {} children",
        parent.entity_type,
        parent.id,
        deleted.len() - 1
    );
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Series, Sermon};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cascade_deletes_children() {
        let store = SyncStore::open_in_memory().await.unwrap();
        let series = store
            .create_content("owner", None, &Series::new("Advent"))
            .await
            .unwrap();
        let first = store
            .create_content("owner", Some(series.id), &Sermon::new("Hope"))
            .await
            .unwrap();
        let second = store
            .create_content("owner", Some(series.id), &Sermon::new("Peace"))
            .await
            .unwrap();
        let unrelated = store
            .create_content("owner", None, &Sermon::new("Joy"))
            .await
            .unwrap();

        let deleted = soft_delete_cascade(&store, &series.id).await.unwrap();
        assert_eq!(deleted.len(), 3);
        assert_eq!(deleted.last(), Some(&series.id));
        assert!(deleted.contains(&first.id) && deleted.contains(&second.id));

        for id in &deleted {
            let record = store.get_any(id).await.unwrap().unwrap();
            assert!(record.is_tombstone());
        }
        assert!(store.get(&unrelated.id).await.is_ok());
        assert_eq!(store.list_dirty(EntityType::Sermon).await.unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plain_delete_leaves_children() {
        let store = SyncStore::open_in_memory().await.unwrap();
        let series = store
            .create_content("owner", None, &Series::new("Lent"))
            .await
            .unwrap();
        let sermon = store
            .create_content("owner", Some(series.id), &Sermon::new("Ashes"))
            .await
            .unwrap();

        store.soft_delete(&series.id).await.unwrap();
        let child = store.get(&sermon.id).await.unwrap();
        assert_eq!(child.parent_id, Some(series.id));
    }
}
