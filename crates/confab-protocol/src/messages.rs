use serde::{Deserialize, Serialize};

use crate::types::{
    AppData, ConsumerId, ConsumerOptions, DtlsParameters, MediaKind, ParticipantId, ProducerId,
    ProducerSummary, RoomId, RtpCapabilities, RtpParameters, TransportDirection, TransportId,
    TransportOptions,
};

/// A client action with the id its response will carry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub request_id: u64,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to a participant (must be the first frame)
    Identify { participant_id: ParticipantId },

    /// Join a call room, leaving any other room first
    JoinRoom { room_id: RoomId },

    /// Fetch the RTP capabilities of the current room's router
    GetRouterRtpCapabilities,

    /// Create the send or receive transport
    CreateTransport { direction: TransportDirection },

    /// Finish the DTLS handshake of a transport
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Start publishing a stream on the send transport
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: AppData,
    },

    /// Stop publishing a stream
    CloseProducer { producer_id: ProducerId },

    /// Subscribe to another participant's stream on the receive transport
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Start the flow of a (paused) consumer
    ResumeConsumer { consumer_id: ConsumerId },

    /// Stop a subscription
    CloseConsumer { consumer_id: ConsumerId },

    /// Leave the current room
    LeaveRoom,

    /// Ping to keep connection alive
    Ping,
}

impl ClientMessage {
    /// Event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Identify { .. } => "identify",
            ClientMessage::JoinRoom { .. } => "join_room",
            ClientMessage::GetRouterRtpCapabilities => "get_router_rtp_capabilities",
            ClientMessage::CreateTransport { .. } => "create_transport",
            ClientMessage::ConnectTransport { .. } => "connect_transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::CloseProducer { .. } => "close_producer",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume_consumer",
            ClientMessage::CloseConsumer { .. } => "close_consumer",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Error classes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Incompatible,
    InvalidState,
    EngineFailure,
    Unavailable,
    BadRequest,
}

/// Successful result of a client request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseData {
    Joined {
        room_id: RoomId,
        rtp_capabilities: RtpCapabilities,
        producers: Vec<ProducerSummary>,
    },
    RouterRtpCapabilities {
        rtp_capabilities: RtpCapabilities,
    },
    TransportCreated {
        direction: TransportDirection,
        transport: TransportOptions,
    },
    TransportConnected {
        transport_id: TransportId,
    },
    Produced {
        producer_id: ProducerId,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    Consumed {
        consumer: ConsumerOptions,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    Left,
    Pong,
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection bound to a participant
    Identified { participant_id: ParticipantId },

    /// Result of a request
    Response { request_id: u64, data: ResponseData },

    /// Error message, tied to a request when there is one
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },

    /// Another participant started publishing in the room
    NewProducer {
        room_id: RoomId,
        producer: ProducerSummary,
    },

    /// One of the participant's producers was closed by the server
    ProducerClosed { producer_id: ProducerId },

    /// One of the participant's consumers was closed (source gone, transport gone)
    ConsumerClosed { consumer_id: ConsumerId },

    /// Another participant left the room
    ParticipantLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_sits_next_to_the_event_tag() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"request_id":7,"type":"join_room","room_id":"r1"}"#).unwrap();
        assert_eq!(request.request_id, 7);
        match request.message {
            ClientMessage::JoinRoom { room_id } => assert_eq!(room_id.as_str(), "r1"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn unit_events_parse() {
        let request: ClientRequest =
            serde_json::from_str(r#"{"request_id":3,"type":"leave_room"}"#).unwrap();
        assert!(matches!(request.message, ClientMessage::LeaveRoom));
        assert_eq!(request.message.name(), "leave_room");
    }

    #[test]
    fn error_without_request_omits_the_field() {
        let json = serde_json::to_value(ServerMessage::Error {
            request_id: None,
            code: ErrorCode::BadRequest,
            message: "Invalid message format".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "bad_request");
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn pong_is_a_response_to_the_ping() {
        let json = serde_json::to_value(ServerMessage::Response {
            request_id: 42,
            data: ResponseData::Pong,
        })
        .unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["request_id"], 42);
        assert_eq!(json["data"]["kind"], "pong");
    }
}
