//! Routes free-form questions to the backend's knowledge endpoints before
//! anything reaches the avatar.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use avatarlink_common::protocol::{ChatRequest, CourseSummaries, EnrollmentRecord, FaqEntry};

use crate::proxy::BackendClient;

pub const NO_COURSES: &str = "No courses available at the moment.";
pub const COURSES_UNREACHABLE: &str =
    "Sorry, my live system is unreachable. Please try again later.";
pub const NO_FAQS: &str = "No FAQs available right now.";
pub const FAQS_UNAVAILABLE: &str = "Sorry, FAQs are not available right now.";
pub const NO_ENROLLMENTS: &str = "No recent enrollments.";
pub const ENROLLMENTS_UNAVAILABLE: &str = "Sorry, I can’t retrieve recent enrollments right now.";
const CHAT_UNAVAILABLE: &str = "Chat service is unavailable.";
const ENROLL_FAILED: &str = "Unable to create enrollment. Please try again.";

pub const DEFAULT_ENROLLMENT_LIMIT: u32 = 10;

const REPLY_FIELDS: [&str; 4] = ["reply", "answer", "response", "message"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KnowledgeError {
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Courses,
    Faqs,
    Chat,
}

impl Route {
    pub fn for_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("course") {
            Self::Courses
        } else if lower.contains("faq") {
            Self::Faqs
        } else {
            Self::Chat
        }
    }
}

/// Filter for `/enrollments/recent`. Unset fields are left out of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentQuery {
    pub limit: Option<u32>,
    pub source: Option<String>,
}

impl Default for EnrollmentQuery {
    fn default() -> Self {
        Self {
            limit: Some(DEFAULT_ENROLLMENT_LIMIT),
            source: None,
        }
    }
}

impl EnrollmentQuery {
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(source) = self.source.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("source", source.to_string()));
        }
        pairs
    }
}

#[derive(Clone)]
pub struct KnowledgeRouter {
    http: BackendClient,
    timeout: Duration,
}

impl KnowledgeRouter {
    pub fn new(http: BackendClient, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Answers `text` from whichever endpoint its wording points at.
    pub async fn ask(&self, text: &str) -> Result<String, KnowledgeError> {
        let route = Route::for_text(text);
        debug!(?route, "routing question");
        match route {
            Route::Courses => Ok(self.courses_text().await),
            Route::Faqs => Ok(self.faqs_text().await),
            Route::Chat => self.chat(text).await,
        }
    }

    pub async fn courses_text(&self) -> String {
        let url = self.http.backend_url("/courses/summary/all");
        match self.http.get_json(&url, Some(self.timeout)).await {
            Ok(body) => courses_to_text(body),
            Err(e) => {
                warn!("course summaries unavailable: {e}");
                COURSES_UNREACHABLE.to_string()
            }
        }
    }

    pub async fn faqs_text(&self) -> String {
        let url = self.http.backend_url("/faqs");
        match self.http.get_json(&url, Some(self.timeout)).await {
            Ok(body) => faqs_to_text(body),
            Err(e) => {
                warn!("faqs unavailable: {e}");
                FAQS_UNAVAILABLE.to_string()
            }
        }
    }

    pub async fn chat(&self, message: &str) -> Result<String, KnowledgeError> {
        let url = self.http.backend_url("/chat");
        let builder = self
            .http
            .request(Method::POST, &url)
            .json(&ChatRequest {
                message: message.to_string(),
            })
            .timeout(self.timeout);
        let (_, body) = self.http.execute(builder).await.map_err(|e| {
            warn!("chat request failed: {e}");
            KnowledgeError::Unavailable(CHAT_UNAVAILABLE.to_string())
        })?;
        Ok(chat_reply(&body))
    }

    /// Recent enrollments as returned by the backend. The backend admin key,
    /// when configured, authorises the call.
    pub async fn recent_enrollments(
        &self,
        query: &EnrollmentQuery,
    ) -> Result<Value, KnowledgeError> {
        let mut url = url::Url::parse(&self.http.backend_url("/enrollments/recent"))
            .map_err(|e| KnowledgeError::Unavailable(format!("enrollments url: {e}")))?;
        let pairs = query.pairs();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }
        self.http
            .get_json(url.as_str(), Some(self.timeout))
            .await
            .map_err(|e| {
                warn!("recent enrollments unavailable: {e}");
                KnowledgeError::Unavailable("Unable to retrieve recent enrollments.".to_string())
            })
    }

    pub async fn recent_enrollments_text(&self, query: &EnrollmentQuery) -> String {
        match self.recent_enrollments(query).await {
            Ok(body) => enrollments_to_text(body),
            Err(_) => ENROLLMENTS_UNAVAILABLE.to_string(),
        }
    }

    /// Submits an enrollment; the payload is passed through as-is.
    pub async fn enroll(&self, payload: &Value) -> Result<Value, KnowledgeError> {
        let url = self.http.backend_url("/enroll");
        self.http
            .post_json(&url, payload, None, Some(self.timeout))
            .await
            .map_err(|e| {
                warn!("enrollment failed: {e}");
                KnowledgeError::Unavailable(ENROLL_FAILED.to_string())
            })
    }

    pub async fn health(&self) -> Result<Value, KnowledgeError> {
        let url = self.http.backend_url("/health");
        self.http
            .get_json(&url, Some(self.timeout))
            .await
            .map_err(|e| KnowledgeError::Unavailable(format!("health check failed: {e}")))
    }
}

fn courses_to_text(body: Value) -> String {
    let summaries: CourseSummaries = serde_json::from_value(body).unwrap_or_default();
    let lines: Vec<String> = summaries
        .courses
        .iter()
        .map(|course| match course.get("summary").and_then(Value::as_str) {
            Some(summary) if !summary.is_empty() => summary.to_string(),
            _ => course.to_string(),
        })
        .collect();
    if lines.is_empty() {
        NO_COURSES.to_string()
    } else {
        lines.join("\n")
    }
}

fn faqs_to_text(body: Value) -> String {
    let entries: Vec<FaqEntry> = serde_json::from_value(body).unwrap_or_default();
    if entries.is_empty() {
        return NO_FAQS.to_string();
    }
    entries
        .iter()
        .map(|faq| format!("{}: {}", faq.question, faq.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

fn enrollments_to_text(body: Value) -> String {
    let records: Vec<EnrollmentRecord> = serde_json::from_value(body).unwrap_or_default();
    if records.is_empty() {
        return NO_ENROLLMENTS.to_string();
    }
    records
        .iter()
        .map(|e| {
            format!(
                "{} enrolled in {} on {}",
                e.full_name,
                e.program_code
                    .as_deref()
                    .filter(|code| !code.is_empty())
                    .unwrap_or("a course"),
                e.created_at
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain-text bodies are the reply; JSON bodies carry it in a known member.
fn chat_reply(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    match &json {
        Value::String(reply) => reply.clone(),
        Value::Object(map) => REPLY_FIELDS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map_or_else(|| json.to_string(), str::to_string),
        other => other.to_string(),
    }
}
