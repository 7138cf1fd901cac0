// Per-user registry of live connections with a capacity limit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("max connections reached for user ({limit})")]
    MaxConnectionsExceeded { limit: usize },
}

/// Tracks `subject_id -> {connection_id}`.
///
/// Admission holds the write lock across check and insert, so concurrent
/// attempts for one user can never push the set past the limit.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    max_per_user: usize,
    entries: Arc<RwLock<HashMap<String, HashSet<Uuid>>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_USER)
    }
}

impl ConnectionPool {
    pub fn new(max_per_user: usize) -> Self {
        Self { max_per_user: max_per_user.max(1), entries: Arc::default() }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    pub async fn try_admit(
        &self,
        subject_id: &str,
        connection_id: Uuid,
    ) -> Result<(), CapacityError> {
        let mut guard = self.entries.write().await;
        let connections = guard.entry(subject_id.to_string()).or_default();
        if connections.contains(&connection_id) {
            return Ok(());
        }
        if connections.len() >= self.max_per_user {
            return Err(CapacityError::MaxConnectionsExceeded { limit: self.max_per_user });
        }
        connections.insert(connection_id);
        Ok(())
    }

    /// Removing an absent entry is a no-op.
    pub async fn remove(&self, subject_id: &str, connection_id: Uuid) {
        let mut guard = self.entries.write().await;
        if let Some(connections) = guard.get_mut(subject_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                guard.remove(subject_id);
            }
        }
    }

    pub async fn count_for(&self, subject_id: &str) -> usize {
        self.entries.read().await.get(subject_id).map(HashSet::len).unwrap_or(0)
    }

    pub async fn total_connections(&self) -> usize {
        self.entries.read().await.values().map(HashSet::len).sum()
    }

    pub async fn user_count(&self) -> usize {
        self.entries.read().await.len()
    }
}
