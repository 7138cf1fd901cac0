use std::sync::Arc;

use chrono::Utc;
use collabornest_common::protocol::ws::WsMessage;
use collabornest_common::types::{LeaveReason, MemberInfo, MemberMode};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::registry::{Participant, PresenceRegistry};
use super::PresenceError;
use crate::connection::ConnectionRegistry;

/// Join, leave and disconnect cleanup on top of [`PresenceRegistry`].
///
/// Every operation holds the presence write lock while it queues its
/// notifications, so members of a resource observe events in the order the
/// mutations happened. The connection registry is only ever locked while
/// the presence lock is held, never the other way round.
pub struct ResourceSessionHandler {
    presence: RwLock<PresenceRegistry>,
    connections: Arc<ConnectionRegistry>,
}

impl ResourceSessionHandler {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { presence: RwLock::new(PresenceRegistry::default()), connections }
    }

    pub async fn join(
        &self,
        participant: &Participant,
        resource_id: &str,
        resource_type: &str,
        mode: MemberMode,
    ) -> Result<Vec<MemberInfo>, PresenceError> {
        let mut presence = self.presence.write().await;
        if !self.connections.is_active(participant.connection_id).await {
            return Err(PresenceError::ConnectionNotActive);
        }

        let outcome = presence.join(participant, resource_id, resource_type, mode, Utc::now())?;
        let event = WsMessage::UserJoined {
            user_id: participant.subject_id.clone(),
            username: participant.username.clone(),
            mode,
            resource_id: resource_id.to_string(),
        };
        self.notify(&outcome.recipients, &event).await;

        debug!(
            connection_id = %participant.connection_id,
            user_id = %participant.subject_id,
            resource_id,
            resource_type = %outcome.resource_type,
            mode = mode.as_str(),
            members = outcome.members.len(),
            "resource joined"
        );
        Ok(outcome.members)
    }

    pub async fn leave(
        &self,
        participant: &Participant,
        resource_id: &str,
    ) -> Result<(), PresenceError> {
        let mut presence = self.presence.write().await;
        if !self.connections.is_active(participant.connection_id).await {
            return Err(PresenceError::ConnectionNotActive);
        }

        let outcome = presence.leave(&participant.subject_id, resource_id)?;
        let event = WsMessage::UserLeft {
            user_id: participant.subject_id.clone(),
            resource_id: resource_id.to_string(),
            reason: LeaveReason::Manual,
        };
        self.notify(&outcome.recipients, &event).await;

        debug!(
            connection_id = %participant.connection_id,
            owner_connection_id = %outcome.connection_id,
            user_id = %participant.subject_id,
            resource_id,
            "resource left"
        );
        Ok(())
    }

    /// Remove every membership of a closing connection, telling the
    /// remaining members of each resource. Returns how many were removed.
    pub async fn cleanup_connection(&self, connection_id: Uuid) -> usize {
        let mut presence = self.presence.write().await;
        let removed = presence.remove_connection(connection_id);

        for membership in &removed {
            let event = WsMessage::UserLeft {
                user_id: membership.subject_id.clone(),
                resource_id: membership.resource_id.clone(),
                reason: LeaveReason::Disconnect,
            };
            self.notify(&membership.recipients, &event).await;
            debug!(
                connection_id = %connection_id,
                user_id = %membership.subject_id,
                resource_id = %membership.resource_id,
                "membership removed on disconnect"
            );
        }

        removed.len()
    }

    pub async fn members(&self, resource_id: &str) -> Vec<MemberInfo> {
        self.presence.read().await.members(resource_id)
    }

    pub async fn resources_for(&self, connection_id: Uuid) -> Vec<String> {
        self.presence.read().await.resources_for(connection_id)
    }

    pub async fn resource_count(&self) -> usize {
        self.presence.read().await.resource_count()
    }

    pub async fn check_consistency(&self) -> Result<(), String> {
        self.presence.read().await.check_consistency()
    }

    async fn notify(&self, recipients: &[Uuid], event: &WsMessage) {
        for connection_id in recipients {
            self.connections.send_to(*connection_id, event.clone()).await;
        }
    }
}
