// Resource membership plus the per-connection reverse index.
//
// Both maps live in one value so every mutation updates them together; the
// session handler wraps the whole registry in a single lock.

use chrono::{DateTime, Utc};
use collabornest_common::types::{MemberInfo, MemberMode};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::PresenceError;

/// Who is asking: the verified subject and the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub subject_id: String,
    pub username: Option<String>,
    pub connection_id: Uuid,
}

#[derive(Debug, Clone)]
struct Membership {
    connection_id: Uuid,
    username: Option<String>,
    mode: MemberMode,
    joined_at: DateTime<Utc>,
    join_seq: u64,
}

#[derive(Debug, Clone)]
struct Resource {
    resource_type: String,
    members: HashMap<String, Membership>,
}

impl Resource {
    fn member_list(&self) -> Vec<MemberInfo> {
        let mut entries = self.members.iter().collect::<Vec<_>>();
        entries.sort_by_key(|(_, membership)| membership.join_seq);
        entries
            .into_iter()
            .map(|(subject_id, membership)| MemberInfo {
                user_id: subject_id.clone(),
                username: membership.username.clone(),
                mode: membership.mode,
                joined_at: membership.joined_at,
            })
            .collect()
    }

    fn connections_excluding(&self, exclude: Uuid) -> Vec<Uuid> {
        let mut entries = self
            .members
            .values()
            .filter(|membership| membership.connection_id != exclude)
            .collect::<Vec<_>>();
        entries.sort_by_key(|membership| membership.join_seq);
        entries.into_iter().map(|membership| membership.connection_id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Type recorded when the resource was created.
    pub resource_type: String,
    /// Full member list ordered by join time, joiner included.
    pub members: Vec<MemberInfo>,
    /// Connections of every other member, to be notified.
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Connection that held the removed membership.
    pub connection_id: Uuid,
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedMembership {
    pub resource_id: String,
    pub subject_id: String,
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    resources: HashMap<String, Resource>,
    by_connection: HashMap<Uuid, HashSet<String>>,
    next_join_seq: u64,
}

impl PresenceRegistry {
    pub fn join(
        &mut self,
        participant: &Participant,
        resource_id: &str,
        resource_type: &str,
        mode: MemberMode,
        joined_at: DateTime<Utc>,
    ) -> Result<JoinOutcome, PresenceError> {
        let already_joined = self
            .resources
            .get(resource_id)
            .is_some_and(|resource| resource.members.contains_key(&participant.subject_id));
        if already_joined {
            return Err(PresenceError::AlreadyJoined);
        }

        self.next_join_seq += 1;
        let join_seq = self.next_join_seq;
        let resource = self.resources.entry(resource_id.to_string()).or_insert_with(|| Resource {
            resource_type: resource_type.to_string(),
            members: HashMap::new(),
        });
        resource.members.insert(
            participant.subject_id.clone(),
            Membership {
                connection_id: participant.connection_id,
                username: participant.username.clone(),
                mode,
                joined_at,
                join_seq,
            },
        );
        self.by_connection
            .entry(participant.connection_id)
            .or_default()
            .insert(resource_id.to_string());

        Ok(JoinOutcome {
            resource_type: resource.resource_type.clone(),
            members: resource.member_list(),
            recipients: resource.connections_excluding(participant.connection_id),
        })
    }

    /// Membership is keyed by subject, so a sibling connection of the same
    /// user may release it; the reverse index of the owning connection is
    /// updated accordingly.
    pub fn leave(
        &mut self,
        subject_id: &str,
        resource_id: &str,
    ) -> Result<LeaveOutcome, PresenceError> {
        let resource = self.resources.get_mut(resource_id).ok_or(PresenceError::NotInResource)?;
        let membership =
            resource.members.remove(subject_id).ok_or(PresenceError::NotInResource)?;
        let recipients = resource.connections_excluding(membership.connection_id);

        if resource.members.is_empty() {
            self.resources.remove(resource_id);
        }
        self.unindex(membership.connection_id, resource_id);

        Ok(LeaveOutcome { connection_id: membership.connection_id, recipients })
    }

    /// Drop every membership held by `connection_id`, once each.
    pub fn remove_connection(&mut self, connection_id: Uuid) -> Vec<RemovedMembership> {
        let Some(resource_ids) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };
        let mut resource_ids = resource_ids.into_iter().collect::<Vec<_>>();
        resource_ids.sort();

        let mut removed = Vec::with_capacity(resource_ids.len());
        for resource_id in resource_ids {
            let Some(resource) = self.resources.get_mut(&resource_id) else {
                continue;
            };
            let subject_id = resource
                .members
                .iter()
                .find(|(_, membership)| membership.connection_id == connection_id)
                .map(|(subject_id, _)| subject_id.clone());
            let Some(subject_id) = subject_id else {
                continue;
            };

            resource.members.remove(&subject_id);
            let recipients = resource.connections_excluding(connection_id);
            if resource.members.is_empty() {
                self.resources.remove(&resource_id);
            }
            removed.push(RemovedMembership { resource_id, subject_id, recipients });
        }

        removed
    }

    pub fn members(&self, resource_id: &str) -> Vec<MemberInfo> {
        self.resources.get(resource_id).map(Resource::member_list).unwrap_or_default()
    }

    pub fn resources_for(&self, connection_id: Uuid) -> Vec<String> {
        let mut ids = self
            .by_connection
            .get(&connection_id)
            .map(|ids| ids.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Verify that the reverse index and the member maps describe the same
    /// set of `(connection, resource)` pairs and that no resource is empty.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut forward = HashSet::new();
        for (resource_id, resource) in &self.resources {
            if resource.members.is_empty() {
                return Err(format!("resource '{resource_id}' has no members"));
            }
            for membership in resource.members.values() {
                forward.insert((membership.connection_id, resource_id.clone()));
            }
        }

        let mut reverse = HashSet::new();
        for (connection_id, resource_ids) in &self.by_connection {
            if resource_ids.is_empty() {
                return Err(format!("connection {connection_id} has an empty index entry"));
            }
            for resource_id in resource_ids {
                reverse.insert((*connection_id, resource_id.clone()));
            }
        }

        if forward != reverse {
            let missing_in_index = forward.difference(&reverse).count();
            let dangling_in_index = reverse.difference(&forward).count();
            return Err(format!(
                "reverse index out of sync: {missing_in_index} missing, {dangling_in_index} dangling"
            ));
        }

        Ok(())
    }

    fn unindex(&mut self, connection_id: Uuid, resource_id: &str) {
        if let Some(resource_ids) = self.by_connection.get_mut(&connection_id) {
            resource_ids.remove(resource_id);
            if resource_ids.is_empty() {
                self.by_connection.remove(&connection_id);
            }
        }
    }
}
