use async_trait::async_trait;
use tracing::debug;

use super::{ManagedObject, ObjectId};
use crate::Result;
use crate::collection::DataCollectionItem;

/// Storage for objects and collection items.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist a node created by the scheduler itself.
    async fn create_node(&self, node: &ManagedObject) -> Result<()>;

    async fn save_item(&self, owner: ObjectId, item: &DataCollectionItem) -> Result<()>;

    async fn delete_item(&self, owner: ObjectId, item_id: u32) -> Result<()>;
}

/// Persistence that keeps nothing. Used when running without a database.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

#[async_trait]
impl Persistence for NullPersistence {
    async fn create_node(&self, node: &ManagedObject) -> Result<()> {
        debug!(object_id = node.id(), name = node.name(), "Node not persisted (no storage)");
        Ok(())
    }

    async fn save_item(&self, owner: ObjectId, item: &DataCollectionItem) -> Result<()> {
        debug!(owner, item_id = item.id(), "Item not persisted (no storage)");
        Ok(())
    }

    async fn delete_item(&self, owner: ObjectId, item_id: u32) -> Result<()> {
        debug!(owner, item_id, "Item deletion not persisted (no storage)");
        Ok(())
    }
}
