//! Per-instance cancellation tokens

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation scope for background work owned by one instance
///
/// Pending notification retries and auto-transition checks hold a child of the
/// instance's token; reaching a terminal state cancels it and drops the entry.
#[derive(Default)]
pub struct LifecycleTokens {
    tokens: DashMap<Uuid, CancellationToken>,
    root: CancellationToken,
}

impl LifecycleTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for work on behalf of `instance_id`
    pub fn token(&self, instance_id: Uuid) -> CancellationToken {
        self.tokens
            .entry(instance_id)
            .or_insert_with(|| self.root.child_token())
            .child_token()
    }

    /// Cancel everything in flight for a terminated instance
    pub fn terminate(&self, instance_id: Uuid) {
        if let Some((_, token)) = self.tokens.remove(&instance_id) {
            token.cancel();
        }
    }

    /// Cancel all instance work, used on shutdown
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn tracked(&self) -> usize {
        self.tokens.len()
    }
}
