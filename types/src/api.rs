//! Wire schema: channel protocol frames, webhook envelope, REST bodies.
//!
//! Channel frames are tagged JSON objects (`{"type": "join", ...}`); the
//! payload field names below are the protocol, so renames here are breaking.

use crate::{CharacterId, Killmail, KillmailId, Sequence, SystemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic joined by every channel connection.
pub const CHANNEL_TOPIC: &str = "killmails:lobby";

/// Client-to-server channel frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        request_id: String,
        #[serde(default)]
        systems: Vec<SystemId>,
        #[serde(default)]
        character_ids: Vec<CharacterId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preload: Option<PreloadRequest>,
    },
    SubscribeSystems {
        request_id: String,
        systems: Vec<SystemId>,
    },
    UnsubscribeSystems {
        request_id: String,
        systems: Vec<SystemId>,
    },
    SubscribeCharacters {
        request_id: String,
        character_ids: Vec<CharacterId>,
    },
    UnsubscribeCharacters {
        request_id: String,
        character_ids: Vec<CharacterId>,
    },
}

/// Backfill requested at join time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PreloadRequest {
    pub enabled: bool,
    #[serde(default = "default_since_hours")]
    pub since_hours: u32,
    #[serde(default = "default_preload_limit")]
    pub limit: usize,
}

fn default_since_hours() -> u32 {
    24
}

fn default_preload_limit() -> usize {
    100
}

/// Server-to-client channel frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        preload: Option<PreloadPlan>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
    KillmailUpdate {
        killmail: Killmail,
    },
    SystemStats {
        system_id: SystemId,
        kill_count: u64,
        timestamp: DateTime<Utc>,
    },
}

/// What the server scheduled in response to a preload request. Delivery is
/// best-effort and trickles in after the ack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreloadPlan {
    pub systems: Vec<PreloadSystemPlan>,
    pub total: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreloadSystemPlan {
    pub system_id: SystemId,
    pub count: usize,
}

/// Envelope POSTed to webhook callbacks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub system_id: SystemId,
    pub timestamp: DateTime<Utc>,
    pub kills: Vec<Killmail>,
}

impl WebhookPayload {
    pub const KIND_KILLMAIL_UPDATE: &'static str = "killmail_update";
}

/// REST error envelope: `{error: {...}, timestamp}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Body of `POST /api/v1/kills/systems`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemKillsRequest {
    pub system_ids: Vec<SystemId>,
    #[serde(default = "default_since_hours")]
    pub since_hours: u32,
    #[serde(default = "default_rest_limit")]
    pub limit: usize,
}

fn default_rest_limit() -> usize {
    200
}

/// Body of `POST /api/v1/subscriptions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub subscriber_id: String,
    #[serde(default)]
    pub system_ids: Vec<SystemId>,
    #[serde(default)]
    pub character_ids: Vec<CharacterId>,
    pub callback_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionCreated {
    pub id: String,
}

/// A registered subscription as returned by `GET /api/v1/subscriptions`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub id: String,
    pub subscriber_id: String,
    pub system_ids: Vec<SystemId>,
    pub character_ids: Vec<CharacterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct KillCountResponse {
    pub count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub details: serde_json::Value,
}

/// A stored event as seen over the wire (REST responses include the
/// sequence so clients can resume ordering conversations).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KillmailEnvelope {
    pub sequence: Sequence,
    pub system_id: SystemId,
    pub killmail: Killmail,
}

/// Static description served on `GET /websocket`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub path: String,
    pub topic: String,
    pub client_frames: Vec<String>,
    pub server_frames: Vec<String>,
    pub max_systems: usize,
    pub max_characters: usize,
}

/// Lookup key for fetching a full killmail from the upstream API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillmailRef {
    pub id: KillmailId,
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_frame_parses_with_defaults() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"join","request_id":"r1"}"#).unwrap();
        match frame {
            ClientFrame::Join {
                request_id,
                systems,
                character_ids,
                preload,
            } => {
                assert_eq!(request_id, "r1");
                assert!(systems.is_empty());
                assert!(character_ids.is_empty());
                assert!(preload.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn preload_defaults_apply() {
        let preload: PreloadRequest = serde_json::from_str(r#"{"enabled":true}"#).unwrap();
        assert!(preload.enabled);
        assert_eq!(preload.since_hours, 24);
        assert_eq!(preload.limit, 100);
    }

    #[test]
    fn server_frames_are_tagged() {
        let frame = ServerFrame::Error {
            request_id: Some("r9".into()),
            code: "invalid_format".into(),
            message: "bad payload".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "invalid_format");
    }

    #[test]
    fn webhook_payload_kind_is_literal() {
        let payload = WebhookPayload {
            kind: WebhookPayload::KIND_KILLMAIL_UPDATE.into(),
            system_id: 30000142,
            timestamp: Utc::now(),
            kills: vec![],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "killmail_update");
    }
}
