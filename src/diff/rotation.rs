//! Scoped removal from serving rotation.

use super::ServingRotation;
use crate::error::Result;
use crate::types::ShardTarget;
use std::sync::Arc;

/// Tracks shards taken out of rotation and puts them back.
///
/// Call [`restore`](Self::restore) on every normal exit. If the guard is
/// dropped without it, for example because the diff future was cancelled,
/// the restore is spawned onto the current runtime.
#[derive(Debug)]
pub struct RotationGuard {
    rotation: Arc<dyn ServingRotation>,
    removed: Vec<ShardTarget>,
}

impl RotationGuard {
    pub fn new(rotation: Arc<dyn ServingRotation>) -> Self {
        Self {
            rotation,
            removed: Vec::new(),
        }
    }

    /// Take `target` out of rotation.
    pub async fn remove(&mut self, target: &ShardTarget) -> Result<()> {
        self.rotation.remove_from_rotation(target).await?;
        tracing::debug!(shard = %target, "Removed from serving rotation");
        self.removed.push(target.clone());
        Ok(())
    }

    /// Shards currently held out of rotation.
    pub fn removed(&self) -> &[ShardTarget] {
        &self.removed
    }

    /// Put every removed shard back, most recent first.
    ///
    /// Tries all of them and returns the first failure.
    pub async fn restore(&mut self) -> Result<()> {
        restore_all(&*self.rotation, std::mem::take(&mut self.removed)).await
    }
}

impl Drop for RotationGuard {
    fn drop(&mut self) {
        if self.removed.is_empty() {
            return;
        }
        let removed = std::mem::take(&mut self.removed);
        let rotation = Arc::clone(&self.rotation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = restore_all(&*rotation, removed).await {
                        tracing::error!(error = %e, "Deferred rotation restore failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    shards = ?removed,
                    "Rotation guard dropped outside a runtime, shards left out of rotation"
                );
            }
        }
    }
}

async fn restore_all(rotation: &dyn ServingRotation, removed: Vec<ShardTarget>) -> Result<()> {
    let mut first_error = None;
    for target in removed.into_iter().rev() {
        match rotation.restore_to_rotation(&target).await {
            Ok(()) => tracing::debug!(shard = %target, "Restored to serving rotation"),
            Err(e) => {
                tracing::error!(shard = %target, error = %e, "Failed to restore serving rotation");
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}
