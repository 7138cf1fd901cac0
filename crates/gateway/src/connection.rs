// Connection lifecycle: admission, bookkeeping, disconnect and shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use collabornest_common::protocol::ws::{WsMessage, CLOSE_CODE_GOING_AWAY};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, IdentityClaim, TokenVerifier};
use crate::error::ErrorCode;
use crate::metrics::{GatewayMetrics, GaugeSnapshot};
use crate::pool::{CapacityError, ConnectionPool};
use crate::presence::ResourceSessionHandler;

pub const SHUTDOWN_MESSAGE: &str = "Server shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Authenticating, Self::Active)
                | (Self::Authenticating, Self::Closed)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    NetworkError,
    IdleTimeout,
    ServerShutdown,
}

impl DisconnectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::NetworkError => "network_error",
            Self::IdleTimeout => "idle_timeout",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

/// Work queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(WsMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub connection_id: Uuid,
    pub identity: IdentityClaim,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: ConnectionState,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("connection {0} is not registered")]
    Unknown(Uuid),
    #[error("invalid connection transition {from} -> {to}")]
    Invalid { from: ConnectionState, to: ConnectionState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Registry(#[from] TransitionError),
}

/// `connection_id -> record`, plus the outbound channel of each socket.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionRecord>>,
    emptied: Notify,
}

impl ConnectionRegistry {
    pub async fn insert(
        &self,
        connection_id: Uuid,
        identity: IdentityClaim,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) {
        let now = Utc::now();
        self.connections.write().await.insert(
            connection_id,
            ConnectionRecord {
                connection_id,
                identity,
                connected_at: now,
                last_activity_at: now,
                state: ConnectionState::Authenticating,
                outbound,
            },
        );
    }

    pub async fn transition(
        &self,
        connection_id: Uuid,
        next: ConnectionState,
    ) -> Result<ConnectionState, TransitionError> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&connection_id).ok_or(TransitionError::Unknown(connection_id))?;
        let previous = record.state;
        if !previous.can_transition_to(next) {
            return Err(TransitionError::Invalid { from: previous, to: next });
        }
        record.state = next;
        Ok(previous)
    }

    /// Move an `Active` connection to `Closing` and hand back its identity.
    /// Returns `None` when someone else already started closing it.
    pub async fn begin_close(&self, connection_id: Uuid) -> Option<IdentityClaim> {
        let mut guard = self.connections.write().await;
        let record = guard.get_mut(&connection_id)?;
        if !record.state.can_transition_to(ConnectionState::Closing) {
            return None;
        }
        record.state = ConnectionState::Closing;
        Some(record.identity.clone())
    }

    pub async fn state(&self, connection_id: Uuid) -> Option<ConnectionState> {
        self.connections.read().await.get(&connection_id).map(|record| record.state)
    }

    pub async fn is_active(&self, connection_id: Uuid) -> bool {
        self.state(connection_id).await == Some(ConnectionState::Active)
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<ConnectionRecord> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn touch(&self, connection_id: Uuid) -> bool {
        match self.connections.write().await.get_mut(&connection_id) {
            Some(record) => {
                record.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Best effort: a closed receiver is not an error for the sender.
    pub async fn send_to(&self, connection_id: Uuid, message: WsMessage) -> bool {
        self.push(connection_id, Outbound::Event(message)).await
    }

    pub async fn close(&self, connection_id: Uuid, code: u16, reason: &str) -> bool {
        self.push(connection_id, Outbound::Close { code, reason: reason.to_string() }).await
    }

    pub async fn ids_in_state(&self, state: ConnectionState) -> Vec<Uuid> {
        let mut ids = self
            .connections
            .read()
            .await
            .values()
            .filter(|record| record.state == state)
            .map(|record| record.connection_id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        let mut ids = self.connections.read().await.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn remove(&self, connection_id: Uuid) -> Option<ConnectionRecord> {
        let mut guard = self.connections.write().await;
        let removed = guard.remove(&connection_id);
        if guard.is_empty() {
            self.emptied.notify_waiters();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }

    async fn push(&self, connection_id: Uuid, outbound: Outbound) -> bool {
        match self.connections.read().await.get(&connection_id) {
            Some(record) => record.outbound.send(outbound).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_connections: usize,
    pub connected_users: usize,
    pub active_resources: usize,
    pub shutting_down: bool,
}

/// Owns every connection from admission to removal.
pub struct ConnectionManager {
    verifier: Arc<dyn TokenVerifier>,
    pool: ConnectionPool,
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<ResourceSessionHandler>,
    metrics: Arc<GatewayMetrics>,
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        pool: ConnectionPool,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<ResourceSessionHandler>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self { verifier, pool, registry, sessions, metrics, shutting_down: AtomicBool::new(false) }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<ResourceSessionHandler> {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn authenticate(&self, credential: &str) -> Result<IdentityClaim, AuthError> {
        self.verifier.verify(credential).inspect_err(|error| {
            let code = ErrorCode::from(error);
            self.metrics.record_auth_rejection(code.as_str());
            warn!(code = code.as_str(), error = %error, "rejected websocket handshake");
        })
    }

    /// Register an authenticated socket. On success the connection is
    /// `Active` and reachable through its outbound channel.
    pub async fn admit(
        &self,
        identity: IdentityClaim,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Uuid, AdmitError> {
        if self.is_shutting_down() {
            return Err(AdmitError::ShuttingDown);
        }

        let connection_id = Uuid::new_v4();
        let subject_id = identity.subject_id.clone();
        self.registry.insert(connection_id, identity, outbound).await;

        if let Err(error) = self.pool.try_admit(&subject_id, connection_id).await {
            self.abort_admission(connection_id).await;
            self.metrics.increment_capacity_rejections();
            warn!(
                user_id = %subject_id,
                limit = self.pool.max_per_user(),
                "max connections reached for user"
            );
            return Err(error.into());
        }

        if let Err(error) = self.registry.transition(connection_id, ConnectionState::Active).await {
            self.pool.remove(&subject_id, connection_id).await;
            self.abort_admission(connection_id).await;
            return Err(error.into());
        }

        // Shutdown may have collected its notice recipients before this
        // connection turned Active.
        if self.is_shutting_down() {
            self.disconnect(connection_id, DisconnectReason::ServerShutdown).await;
            return Err(AdmitError::ShuttingDown);
        }

        self.metrics.increment_connections_accepted();
        info!(connection_id = %connection_id, user_id = %subject_id, "connection established");
        Ok(connection_id)
    }

    pub async fn touch(&self, connection_id: Uuid) {
        self.registry.touch(connection_id).await;
    }

    pub async fn active_identity(&self, connection_id: Uuid) -> Option<IdentityClaim> {
        self.registry
            .get(connection_id)
            .await
            .filter(|record| record.state == ConnectionState::Active)
            .map(|record| record.identity)
    }

    /// Run the close path once. Later calls for the same connection are
    /// no-ops and return `false`.
    pub async fn disconnect(&self, connection_id: Uuid, reason: DisconnectReason) -> bool {
        let Some(identity) = self.registry.begin_close(connection_id).await else {
            return false;
        };

        let memberships = self.sessions.cleanup_connection(connection_id).await;
        self.pool.remove(&identity.subject_id, connection_id).await;
        if let Err(error) = self.registry.transition(connection_id, ConnectionState::Closed).await {
            warn!(connection_id = %connection_id, error = %error, "unexpected state while closing");
        }
        self.registry.remove(connection_id).await;

        info!(
            connection_id = %connection_id,
            user_id = %identity.subject_id,
            reason = reason.as_str(),
            memberships,
            "connection closed"
        );
        true
    }

    /// Announce shutdown, wait up to `grace` for clients to leave, then
    /// force-close whoever is left.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let active = self.registry.ids_in_state(ConnectionState::Active).await;
        let grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        info!(connections = active.len(), grace_ms, "broadcasting shutdown notice");

        let notice = WsMessage::ServerShutdown {
            message: SHUTDOWN_MESSAGE.to_string(),
            timeout_ms: grace_ms,
        };
        for connection_id in active {
            self.registry.send_to(connection_id, notice.clone()).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = self.registry.wait_until_empty() => {
                info!("all connections closed within the grace period");
                return;
            }
        }

        let remaining = self.registry.ids().await;
        if !remaining.is_empty() {
            info!(connections = remaining.len(), "force-closing remaining connections");
        }
        for connection_id in remaining {
            self.registry.close(connection_id, CLOSE_CODE_GOING_AWAY, SHUTDOWN_MESSAGE).await;
            self.disconnect(connection_id, DisconnectReason::ServerShutdown).await;
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.pool.total_connections().await,
            connected_users: self.pool.user_count().await,
            active_resources: self.sessions.resource_count().await,
            shutting_down: self.is_shutting_down(),
        }
    }

    pub async fn gauges(&self) -> GaugeSnapshot {
        let stats = self.stats().await;
        GaugeSnapshot {
            connections: stats.total_connections,
            users: stats.connected_users,
            resources: stats.active_resources,
        }
    }

    async fn abort_admission(&self, connection_id: Uuid) {
        let _ = self.registry.transition(connection_id, ConnectionState::Closed).await;
        self.registry.remove(connection_id).await;
    }
}
