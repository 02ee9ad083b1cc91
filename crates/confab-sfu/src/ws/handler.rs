use crate::error::SfuError;
use crate::sfu::SessionCoordinator;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use confab_protocol::{ClientMessage, ClientRequest, ErrorCode, ParticipantId, ResponseData, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize message");
            None
        }
    }
}

fn bad_request(request_id: Option<u64>, message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        request_id,
        code: ErrorCode::BadRequest,
        message: message.into(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // First message binds the connection to a participant
    let identify_msg = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            tracing::warn!("WebSocket closed before identify");
            return;
        }
    };

    let participant_id = match serde_json::from_str::<ClientRequest>(&identify_msg) {
        Ok(ClientRequest {
            message: ClientMessage::Identify { participant_id },
            ..
        }) => participant_id,
        Ok(request) => {
            if let Some(json) = encode(&bad_request(
                Some(request.request_id),
                "First message must be identify",
            )) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Invalid identify message");
            if let Some(json) = encode(&bad_request(None, "Invalid message format")) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    let connection_id = Uuid::new_v4();
    let Some(identified) = encode(&ServerMessage::Identified {
        participant_id: participant_id.clone(),
    }) else {
        return;
    };
    if sender.send(Message::Text(identified.into())).await.is_err() {
        return;
    }

    tracing::info!(participant_id = %participant_id, %connection_id, "Participant identified on WebSocket");

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add_connection(connection_id, participant_id.clone(), tx)
        .await;

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Requests of one connection are handled in order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => dispatch(&state.coordinator, &participant_id, request).await,
                    Err(e) => {
                        tracing::debug!(participant_id = %participant_id, error = %e, "Invalid message");
                        bad_request(None, format!("Invalid message: {e}"))
                    }
                };
                state.connections.send_to_connection(connection_id, &reply).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(participant_id = %participant_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.connections.remove_connection(connection_id).await;
    send_task.abort();

    // Release media only once the last connection of the participant is gone
    state
        .coordinator
        .disconnect_if_unreachable(&participant_id)
        .await;

    tracing::info!(participant_id = %participant_id, %connection_id, "Participant disconnected from WebSocket");
}

/// Run one client request and build the reply carrying its `request_id`
pub(crate) async fn dispatch(
    coordinator: &SessionCoordinator,
    participant_id: &ParticipantId,
    request: ClientRequest,
) -> ServerMessage {
    let request_id = request.request_id;
    let event = request.message.name();

    match handle_client_message(coordinator, participant_id, request.message).await {
        Ok(data) => ServerMessage::Response { request_id, data },
        Err(e) => {
            e.log(event);
            ServerMessage::Error {
                request_id: Some(request_id),
                code: e.code(),
                message: e.client_message(),
            }
        }
    }
}

async fn handle_client_message(
    coordinator: &SessionCoordinator,
    participant_id: &ParticipantId,
    message: ClientMessage,
) -> Result<ResponseData, RequestError> {
    let data = match message {
        ClientMessage::Identify { .. } => return Err(RequestError::AlreadyIdentified),
        ClientMessage::Ping => ResponseData::Pong,
        ClientMessage::JoinRoom { room_id } => {
            let joined = coordinator.join(participant_id, room_id).await?;
            ResponseData::Joined {
                room_id: joined.room_id,
                rtp_capabilities: joined.rtp_capabilities,
                producers: joined.producers,
            }
        }
        ClientMessage::GetRouterRtpCapabilities => ResponseData::RouterRtpCapabilities {
            rtp_capabilities: coordinator.router_rtp_capabilities(participant_id).await?,
        },
        ClientMessage::CreateTransport { direction } => ResponseData::TransportCreated {
            direction,
            transport: coordinator.create_transport(participant_id, direction).await?,
        },
        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            coordinator
                .connect_transport(participant_id, transport_id, dtls_parameters)
                .await?;
            ResponseData::TransportConnected { transport_id }
        }
        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => ResponseData::Produced {
            producer_id: coordinator
                .produce(participant_id, transport_id, kind, rtp_parameters, app_data)
                .await?,
        },
        ClientMessage::CloseProducer { producer_id } => {
            coordinator.close_producer(participant_id, producer_id).await?;
            ResponseData::ProducerClosed { producer_id }
        }
        ClientMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => ResponseData::Consumed {
            consumer: coordinator
                .consume(participant_id, transport_id, producer_id, rtp_capabilities)
                .await?,
        },
        ClientMessage::ResumeConsumer { consumer_id } => {
            coordinator.resume_consumer(participant_id, consumer_id).await?;
            ResponseData::ConsumerResumed { consumer_id }
        }
        ClientMessage::CloseConsumer { consumer_id } => {
            coordinator.close_consumer(participant_id, consumer_id).await?;
            ResponseData::ConsumerClosed { consumer_id }
        }
        ClientMessage::LeaveRoom => {
            coordinator.leave(participant_id).await;
            ResponseData::Left
        }
    };
    Ok(data)
}

/// Failure of a single request: either the session layer refused it or the
/// request makes no sense on an identified connection
#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("connection is already identified")]
    AlreadyIdentified,
    #[error(transparent)]
    Sfu(#[from] SfuError),
}

impl RequestError {
    fn log(&self, event: &str) {
        match self {
            RequestError::AlreadyIdentified => tracing::debug!(event, "Repeated identify"),
            RequestError::Sfu(e) => e.log(event),
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            RequestError::AlreadyIdentified => ErrorCode::BadRequest,
            RequestError::Sfu(e) => e.code(),
        }
    }

    fn client_message(&self) -> String {
        match self {
            RequestError::AlreadyIdentified => self.to_string(),
            RequestError::Sfu(e) => e.client_message(),
        }
    }
}
