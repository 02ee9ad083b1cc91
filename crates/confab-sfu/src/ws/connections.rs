use crate::sfu::Notifier;
use async_trait::async_trait;
use confab_protocol::{ParticipantId, ServerMessage};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to the participant it identified as
    connection_owner: RwLock<HashMap<Uuid, ParticipantId>>,
    /// Map from participant ID to connection IDs (a participant may reconnect before the old socket drops)
    participant_connections: RwLock<HashMap<ParticipantId, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            connection_owner: RwLock::new(HashMap::new()),
            participant_connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        participant_id: ParticipantId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        self.connection_owner
            .write()
            .await
            .insert(connection_id, participant_id.clone());
        self.participant_connections
            .write()
            .await
            .entry(participant_id.clone())
            .or_default()
            .insert(connection_id);

        tracing::debug!(participant_id = %participant_id, %connection_id, "Participant connected");
    }

    pub async fn remove_connection(&self, connection_id: Uuid) {
        let owner = self.connection_owner.write().await.remove(&connection_id);

        if let Some(participant_id) = owner {
            let mut participants = self.participant_connections.write().await;
            if let Some(conns) = participants.get_mut(&participant_id) {
                conns.remove(&connection_id);
                if conns.is_empty() {
                    participants.remove(&participant_id);
                }
            }

            tracing::debug!(participant_id = %participant_id, %connection_id, "Participant connection closed");
        }

        self.senders.write().await.remove(&connection_id);
    }

    pub async fn send_to_participant(&self, participant_id: &ParticipantId, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let participants = self.participant_connections.read().await;
        let senders = self.senders.read().await;

        if let Some(conn_ids) = participants.get(participant_id) {
            for conn_id in conn_ids {
                if let Some(sender) = senders.get(conn_id) {
                    if let Err(e) = sender.send(json.clone()) {
                        tracing::error!(participant_id = %participant_id, connection_id = %conn_id, error = %e, "Failed to send message");
                    }
                }
            }
        } else {
            tracing::debug!(participant_id = %participant_id, "No connection for participant, dropping message");
        }
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&connection_id) {
            if let Err(e) = sender.send(json) {
                tracing::error!(%connection_id, error = %e, "Failed to send message");
            }
        }
    }

    pub async fn online_participants(&self) -> usize {
        self.participant_connections.read().await.len()
    }

    pub async fn is_online(&self, participant_id: &ParticipantId) -> bool {
        self.participant_connections
            .read()
            .await
            .get(participant_id)
            .map(|conns| !conns.is_empty())
            .unwrap_or(false)
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ConnectionManager {
    async fn notify(&self, participant_id: &ParticipantId, message: ServerMessage) {
        self.send_to_participant(participant_id, &message).await;
    }

    async fn is_reachable(&self, participant_id: &ParticipantId) -> bool {
        self.is_online(participant_id).await
    }
}
