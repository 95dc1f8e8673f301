//! JSON bodies exchanged with the backend and, through its proxy, the provider.

use serde::{Deserialize, Deserializer, Serialize};

/// How the avatar should treat a task's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Free-form reply; the provider may rephrase.
    Talk,
    /// Verbatim echo.
    Repeat,
}

/// `streaming.task` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub session_id: String,
    pub text: String,
    pub task_type: TaskType,
}

/// SDP in the `{type, sdp}` shape browsers and the provider use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionWire {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescriptionWire {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// `streaming.start` request. `sdp` carries the local answer for direct
/// peer sessions and is omitted for room sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescriptionWire>,
}

/// `streaming.ice` request carrying one trickled local candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceRequest {
    pub session_id: String,
    pub candidate: serde_json::Value,
}

/// `streaming.stop` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub session_id: String,
}

/// `streaming.new` request issued by the token-based SDK client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionRequest {
    pub quality: String,
    pub avatar_name: String,
    pub version: String,
    pub video_encoding: String,
}

/// `streaming.new` response payload (inside the provider envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSessionData {
    pub session_id: String,
    pub url: String,
    pub access_token: String,
}

/// The provider wraps most payloads as `{code, data, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEnvelope<T> {
    #[serde(default)]
    pub code: Option<i64>,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// ICE server entry as returned next to a remote offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

/// `/chat` request for the knowledge backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// One `/faqs` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}

/// `/courses/summary/all` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourseSummaries {
    #[serde(default)]
    pub courses: Vec<serde_json::Value>,
}

/// One `/enrollments/recent` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub full_name: String,
    #[serde(default)]
    pub program_code: Option<String>,
    #[serde(default)]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_request_wire_shape() {
        let req = TaskRequest {
            session_id: "s1".into(),
            text: "hello".into(),
            task_type: TaskType::Repeat,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"session_id": "s1", "text": "hello", "task_type": "repeat"})
        );
    }

    #[test]
    fn test_start_request_omits_missing_sdp() {
        let req = StartRequest {
            session_id: "s1".into(),
            sdp: None,
        };
        assert_eq!(serde_json::to_value(&req).unwrap(), json!({"session_id": "s1"}));

        let req = StartRequest {
            session_id: "s2".into(),
            sdp: Some(SessionDescriptionWire::answer("v=0")),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"session_id": "s2", "sdp": {"type": "answer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_ice_server_accepts_single_url() {
        let one: IceServer = serde_json::from_value(json!({"urls": "stun:a"})).unwrap();
        assert_eq!(one.urls, vec!["stun:a".to_string()]);

        let many: IceServer = serde_json::from_value(json!({
            "urls": ["turn:b", "turns:c"],
            "username": "u",
            "credential": "p"
        }))
        .unwrap();
        assert_eq!(many.urls.len(), 2);
        assert_eq!(many.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_provider_envelope_without_code() {
        let env: ProviderEnvelope<NewSessionData> = serde_json::from_value(json!({
            "data": {"session_id": "s", "url": "wss://x", "access_token": "t"}
        }))
        .unwrap();
        assert!(env.code.is_none());
        assert_eq!(env.data.unwrap().session_id, "s");
    }

    #[test]
    fn test_enrollment_record_optional_program() {
        let rec: EnrollmentRecord = serde_json::from_value(json!({
            "full_name": "Ada Lovelace",
            "created_at": "2024-05-01"
        }))
        .unwrap();
        assert_eq!(rec.program_code, None);
        assert_eq!(rec.created_at, "2024-05-01");
    }
}
