//! Text tasks sent to the avatar.

use tracing::{debug, info, warn};

use avatarlink_common::helpers::has_visible_text;
use avatarlink_common::protocol::{TaskRequest, TaskType};

use crate::media::AudioSink;
use crate::proxy::{status_label, BackendClient, RequestFailure};

/// Text sent as the remote cut-off when interrupting.
pub const INTERRUPT_PLACEHOLDER: &str = ".";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("task request failed ({}): {body}", status_label(.status))]
    RequestFailed { status: Option<u16>, body: String },
    #[error("utterance text is empty")]
    EmptyText,
    #[error("no active session")]
    NotActive,
}

impl From<RequestFailure> for DispatchError {
    fn from(failure: RequestFailure) -> Self {
        Self::RequestFailed {
            status: failure.status,
            body: failure.body,
        }
    }
}

/// A validated utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtteranceTask {
    session_id: String,
    text: String,
    mode: TaskType,
}

impl UtteranceTask {
    /// Rejects empty or whitespace-only text.
    pub fn new(
        session_id: impl Into<String>,
        text: impl Into<String>,
        mode: TaskType,
    ) -> Result<Self, DispatchError> {
        let text = text.into();
        if !has_visible_text(&text) {
            return Err(DispatchError::EmptyText);
        }
        Ok(Self {
            session_id: session_id.into(),
            text,
            mode,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> TaskType {
        self.mode
    }

    fn to_request(&self) -> TaskRequest {
        TaskRequest {
            session_id: self.session_id.clone(),
            text: self.text.clone(),
            task_type: self.mode,
        }
    }
}

/// Result of an interrupt. The local mute has already happened either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptOutcome {
    pub remote_acknowledged: bool,
    pub remote_error: Option<DispatchError>,
}

#[derive(Clone)]
pub struct Dispatcher {
    http: BackendClient,
}

impl Dispatcher {
    pub fn new(http: BackendClient) -> Self {
        Self { http }
    }

    pub async fn send(&self, task: &UtteranceTask) -> Result<(), DispatchError> {
        let url = self.http.provider_url("streaming.task");
        debug!(session_id = task.session_id(), mode = ?task.mode(), "sending task");
        self.http
            .post_json(&url, &task.to_request(), None, None)
            .await?;
        Ok(())
    }

    /// One `streaming.task` call, or none if the text is blank.
    pub async fn speak(
        &self,
        session_id: &str,
        text: &str,
        mode: TaskType,
    ) -> Result<(), DispatchError> {
        let task = UtteranceTask::new(session_id, text, mode)?;
        self.send(&task).await
    }

    /// Mutes locally, then asks the avatar to say something trivial so the
    /// current utterance is cut off remotely.
    pub async fn interrupt(&self, session_id: &str, audio: &dyn AudioSink) -> InterruptOutcome {
        audio.set_muted(true);
        info!(session_id, "local audio muted for interrupt");

        match self
            .speak(session_id, INTERRUPT_PLACEHOLDER, TaskType::Repeat)
            .await
        {
            Ok(()) => InterruptOutcome {
                remote_acknowledged: true,
                remote_error: None,
            },
            Err(e) => {
                warn!(session_id, "remote interrupt failed: {e}");
                InterruptOutcome {
                    remote_acknowledged: false,
                    remote_error: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utterance_rejects_blank_text() {
        assert_eq!(
            UtteranceTask::new("s", "", TaskType::Talk).unwrap_err(),
            DispatchError::EmptyText
        );
        assert_eq!(
            UtteranceTask::new("s", " \t\n ", TaskType::Repeat).unwrap_err(),
            DispatchError::EmptyText
        );
    }

    #[test]
    fn test_utterance_keeps_text_verbatim() {
        let task = UtteranceTask::new("s1", "  hello ", TaskType::Talk).unwrap();
        assert_eq!(task.text(), "  hello ");
        let req = task.to_request();
        assert_eq!(req.session_id, "s1");
        assert_eq!(req.task_type, TaskType::Talk);
    }

    #[test]
    fn test_request_failed_display() {
        let err = DispatchError::from(RequestFailure {
            status: None,
            body: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "task request failed (no response): connection refused"
        );
    }

    #[test]
    fn test_interrupt_outcome_keeps_remote_error() {
        let outcome = InterruptOutcome {
            remote_acknowledged: false,
            remote_error: Some(DispatchError::NotActive),
        };
        let copy = outcome.clone();
        assert_eq!(copy, outcome);
        assert_eq!(copy.remote_error, Some(DispatchError::NotActive));
    }
}
