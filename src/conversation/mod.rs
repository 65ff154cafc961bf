//! Conversation state: message history, turn phase and preview status.
//!
//! [`Conversation`] is plain serializable data. It only changes through
//! [`Conversation::apply`], which checks each [`Transition`] against the
//! current phase, so the HTTP API and the terminal client share one set of
//! rules.

pub mod driver;
pub mod session;

pub use driver::{Driver, DriverEvent, TurnOutcome};
pub use session::{Session, SessionStore};

use crate::preview::SandboxHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Most recent notices kept per conversation.
const MAX_NOTICES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingUser,
    AwaitingAssistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PreviewState {
    Idle,
    Deploying,
    /// Sandbox acquired, waiting for the preview server to answer.
    Starting { url: String },
    Ready { url: String },
    /// The probe gave up; the address is shown anyway.
    Unverified { url: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    UserSubmitted(String),
    AssistantCompleted(String),
    ReplyFailed(String),
    DeployStarted { code: String },
    SandboxAcquired(SandboxHandle),
    PreviewReady,
    PreviewUnverified,
    DeployFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("a reply is already in progress")]
    ReplyInProgress,
    #[error("no reply is in progress")]
    NoReplyInProgress,
    #[error("message is empty")]
    EmptyMessage,
    #[error("no preview is starting")]
    NoPreviewStarting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub phase: TurnPhase,
    /// Code most recently sent to the sandbox.
    pub active_code: Option<String>,
    pub sandbox: Option<SandboxHandle>,
    pub preview: PreviewState,
    /// Transient user-facing errors, newest last.
    pub notices: Vec<String>,
}

impl Conversation {
    /// New conversation seeded with the system instruction.
    pub fn new(system_prompt: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: vec![ChatMessage::new(Role::System, system_prompt)],
            phase: TurnPhase::AwaitingUser,
            active_code: None,
            sandbox: None,
            preview: PreviewState::Idle,
            notices: Vec::new(),
        }
    }

    /// Messages meant for display (everything except the system seed).
    pub fn visible_messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox.as_ref().map(|h| h.sandbox_id.as_str())
    }

    pub fn apply(&mut self, transition: Transition) -> Result<(), TransitionError> {
        match transition {
            Transition::UserSubmitted(content) => {
                if self.phase == TurnPhase::AwaitingAssistant {
                    return Err(TransitionError::ReplyInProgress);
                }
                if content.trim().is_empty() {
                    return Err(TransitionError::EmptyMessage);
                }
                self.messages.push(ChatMessage::new(Role::User, content));
                self.phase = TurnPhase::AwaitingAssistant;
            }
            Transition::AssistantCompleted(content) => {
                self.expect_reply_in_progress()?;
                self.messages.push(ChatMessage::new(Role::Assistant, content));
                self.phase = TurnPhase::AwaitingUser;
            }
            Transition::ReplyFailed(message) => {
                self.expect_reply_in_progress()?;
                self.push_notice(message);
                self.phase = TurnPhase::AwaitingUser;
            }
            Transition::DeployStarted { code } => {
                self.active_code = Some(code);
                self.preview = PreviewState::Deploying;
            }
            Transition::SandboxAcquired(handle) => {
                self.preview = PreviewState::Starting {
                    url: handle.url.clone(),
                };
                self.sandbox = Some(handle);
            }
            Transition::PreviewReady => {
                let url = self.starting_url()?;
                self.preview = PreviewState::Ready { url };
            }
            Transition::PreviewUnverified => {
                let url = self.starting_url()?;
                self.preview = PreviewState::Unverified { url };
            }
            Transition::DeployFailed(message) => {
                self.preview = PreviewState::Failed {
                    message: message.clone(),
                };
                self.push_notice(message);
            }
        }
        Ok(())
    }

    fn expect_reply_in_progress(&self) -> Result<(), TransitionError> {
        if self.phase == TurnPhase::AwaitingAssistant {
            Ok(())
        } else {
            Err(TransitionError::NoReplyInProgress)
        }
    }

    fn starting_url(&self) -> Result<String, TransitionError> {
        match &self.preview {
            PreviewState::Starting { url } => Ok(url.clone()),
            _ => Err(TransitionError::NoPreviewStarting),
        }
    }

    fn push_notice(&mut self, message: String) {
        self.notices.push(message);
        if self.notices.len() > MAX_NOTICES {
            let excess = self.notices.len() - MAX_NOTICES;
            self.notices.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> SandboxHandle {
        SandboxHandle {
            sandbox_id: id.to_string(),
            url: format!("https://5000-{id}.e2b.app"),
            expires_at: None,
        }
    }

    #[test]
    fn starts_with_hidden_system_message() {
        let conv = Conversation::new("be helpful");
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].role, Role::System);
        assert_eq!(conv.visible_messages().count(), 0);
        assert_eq!(conv.phase, TurnPhase::AwaitingUser);
        assert_eq!(conv.preview, PreviewState::Idle);
    }

    #[test]
    fn full_turn_round_trips_phase() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::UserSubmitted("build a counter app".into()))
            .unwrap();
        assert_eq!(conv.phase, TurnPhase::AwaitingAssistant);

        conv.apply(Transition::AssistantCompleted("```python\nx\n```".into()))
            .unwrap();
        assert_eq!(conv.phase, TurnPhase::AwaitingUser);

        let roles: Vec<Role> = conv.visible_messages().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn rejects_submit_while_reply_in_flight() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::UserSubmitted("one".into())).unwrap();
        assert_eq!(
            conv.apply(Transition::UserSubmitted("two".into())),
            Err(TransitionError::ReplyInProgress)
        );
        assert_eq!(conv.messages.len(), 2);
    }

    #[test]
    fn rejects_blank_messages_and_stray_replies() {
        let mut conv = Conversation::new("sys");
        assert_eq!(
            conv.apply(Transition::UserSubmitted("  ".into())),
            Err(TransitionError::EmptyMessage)
        );
        assert_eq!(
            conv.apply(Transition::AssistantCompleted("hi".into())),
            Err(TransitionError::NoReplyInProgress)
        );
    }

    #[test]
    fn failed_reply_keeps_history_and_adds_notice() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::UserSubmitted("hello".into())).unwrap();
        conv.apply(Transition::ReplyFailed("stream broke".into()))
            .unwrap();

        assert_eq!(conv.phase, TurnPhase::AwaitingUser);
        assert_eq!(conv.visible_messages().count(), 1);
        assert_eq!(conv.notices, vec!["stream broke".to_string()]);
    }

    #[test]
    fn preview_progresses_through_deploy() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::DeployStarted {
            code: "print(1)".into(),
        })
        .unwrap();
        assert_eq!(conv.preview, PreviewState::Deploying);
        assert_eq!(
            conv.apply(Transition::PreviewReady),
            Err(TransitionError::NoPreviewStarting)
        );

        conv.apply(Transition::SandboxAcquired(handle("sb-1")))
            .unwrap();
        assert_eq!(conv.sandbox_id(), Some("sb-1"));

        conv.apply(Transition::PreviewReady).unwrap();
        assert_eq!(
            conv.preview,
            PreviewState::Ready {
                url: "https://5000-sb-1.e2b.app".into()
            }
        );
        assert_eq!(conv.active_code.as_deref(), Some("print(1)"));
    }

    #[test]
    fn deploy_failure_keeps_previous_sandbox() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::SandboxAcquired(handle("sb-1")))
            .unwrap();
        conv.apply(Transition::DeployFailed("Failed to prepare sandbox".into()))
            .unwrap();
        assert_eq!(conv.sandbox_id(), Some("sb-1"));
        assert!(matches!(conv.preview, PreviewState::Failed { .. }));
        assert_eq!(conv.notices.len(), 1);
    }

    #[test]
    fn notices_are_capped() {
        let mut conv = Conversation::new("sys");
        for i in 0..25 {
            conv.apply(Transition::DeployFailed(format!("e{i}"))).unwrap();
        }
        assert_eq!(conv.notices.len(), MAX_NOTICES);
        assert_eq!(conv.notices.first().map(String::as_str), Some("e5"));
    }

    #[test]
    fn serializes_with_tagged_preview_state() {
        let mut conv = Conversation::new("sys");
        conv.apply(Transition::SandboxAcquired(handle("sb-9")))
            .unwrap();
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["phase"], "awaiting_user");
        assert_eq!(json["preview"]["status"], "starting");
        assert_eq!(json["sandbox"]["sandboxId"], "sb-9");
        assert_eq!(json["messages"][0]["role"], "system");

        let back: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(back, conv);
    }
}
