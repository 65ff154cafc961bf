//! Per-turn orchestration: stream the reply, extract code, deploy the preview.
//!
//! A turn ends for the chat as soon as the assistant reply is complete. The
//! deploy runs on a spawned task and reports through the same event channel,
//! so a caller streaming events to a client keeps the stream open until the
//! preview is settled.

use super::{ChatMessage, Role, Session, Transition, TransitionError};
use crate::extract;
use crate::llm::ChatProvider;
use crate::preview::{PreviewService, ReadinessProbe, SandboxHandle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub const DEPLOY_FAILED: &str = "Failed to prepare sandbox";
pub const PREVIEW_SLOW: &str =
    "The preview did not answer yet; it may still be starting. Showing it anyway.";

/// Progress of a turn, in the order it happens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    Delta { text: String },
    Message { message: ChatMessage },
    Code {
        code: String,
        language: Option<String>,
    },
    Sandbox { handle: SandboxHandle },
    Preview { url: String, ready: bool },
    Notice { message: String },
    Done,
}

#[derive(Debug)]
pub enum TurnOutcome {
    /// The reply contained code; the deploy continues on this task.
    Deploying(JoinHandle<()>),
    NoCode,
    ReplyFailed,
}

#[derive(Clone)]
pub struct Driver {
    llm: Arc<dyn ChatProvider>,
    preview: Arc<PreviewService>,
    probe: ReadinessProbe,
}

impl Driver {
    pub fn new(
        llm: Arc<dyn ChatProvider>,
        preview: Arc<PreviewService>,
        probe: ReadinessProbe,
    ) -> Self {
        Self {
            llm,
            preview,
            probe,
        }
    }

    /// Record the user's message. Fails without side effects when a reply is
    /// still streaming or the message is blank.
    pub fn begin_turn(
        &self,
        session: &Session,
        input: &str,
    ) -> Result<ChatMessage, TransitionError> {
        session.apply(Transition::UserSubmitted(input.to_string()))?;
        Ok(session
            .with_state(|c| c.last_message().cloned())
            .unwrap_or_else(|| ChatMessage::new(Role::User, input)))
    }

    /// Stream the assistant reply for a turn started with [`begin_turn`](Self::begin_turn).
    pub async fn complete_turn(
        &self,
        session: &Arc<Session>,
        events: UnboundedSender<DriverEvent>,
    ) -> TurnOutcome {
        let history = session.snapshot().messages;

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let (result, ()) = tokio::join!(
            self.llm.stream_chat(&history, delta_tx),
            forward_deltas(delta_rx, &events)
        );

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(conversation = %session.id(), "Assistant reply failed: {e:#}");
                let message = format!("Assistant reply failed: {e}");
                if let Err(err) = session.apply(Transition::ReplyFailed(message.clone())) {
                    tracing::warn!("Unexpected turn state: {err}");
                }
                let _ = events.send(DriverEvent::Notice { message });
                let _ = events.send(DriverEvent::Done);
                return TurnOutcome::ReplyFailed;
            }
        };

        if let Err(err) = session.apply(Transition::AssistantCompleted(reply.clone())) {
            tracing::warn!("Unexpected turn state: {err}");
        }
        if let Some(message) = session.with_state(|c| c.last_message().cloned()) {
            let _ = events.send(DriverEvent::Message { message });
        }

        let block = extract::first_code_block(&reply).filter(|b| !b.code.is_empty());
        let Some(block) = block else {
            tracing::debug!(conversation = %session.id(), "Reply has no code block");
            let _ = events.send(DriverEvent::Done);
            return TurnOutcome::NoCode;
        };

        let blocks = extract::count_code_blocks(&reply);
        if blocks > 1 {
            tracing::debug!(conversation = %session.id(), blocks, "Deploying the first code block only");
        }

        let _ = events.send(DriverEvent::Code {
            code: block.code.clone(),
            language: block.language,
        });

        let driver = self.clone();
        let session = session.clone();
        TurnOutcome::Deploying(tokio::spawn(async move {
            driver.deploy(&session, block.code, &events).await;
            let _ = events.send(DriverEvent::Done);
        }))
    }

    /// Convenience for callers that don't need a separate begin step.
    pub async fn submit(
        &self,
        session: &Arc<Session>,
        input: &str,
        events: UnboundedSender<DriverEvent>,
    ) -> Result<TurnOutcome, TransitionError> {
        let message = self.begin_turn(session, input)?;
        let _ = events.send(DriverEvent::Message { message });
        Ok(self.complete_turn(session, events).await)
    }

    async fn deploy(&self, session: &Session, code: String, events: &UnboundedSender<DriverEvent>) {
        let _deploying = session.deploy_lock.lock().await;

        let _ = session.apply(Transition::DeployStarted { code: code.clone() });
        let sandbox_id = session.with_state(|c| c.sandbox_id().map(str::to_string));

        let handle = match self
            .preview
            .ensure_sandbox(sandbox_id.as_deref(), &code)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(conversation = %session.id(), "Sandbox deploy failed: {e:#}");
                let _ = session.apply(Transition::DeployFailed(DEPLOY_FAILED.to_string()));
                let _ = events.send(DriverEvent::Notice {
                    message: DEPLOY_FAILED.to_string(),
                });
                return;
            }
        };

        let _ = session.apply(Transition::SandboxAcquired(handle.clone()));
        let url = handle.url.clone();
        let _ = events.send(DriverEvent::Sandbox { handle });

        let ready = self.probe.wait(&url).await.is_ready();
        let transition = if ready {
            Transition::PreviewReady
        } else {
            Transition::PreviewUnverified
        };
        if let Err(err) = session.apply(transition) {
            tracing::warn!("Unexpected preview state: {err}");
        }
        if !ready {
            let _ = events.send(DriverEvent::Notice {
                message: PREVIEW_SLOW.to_string(),
            });
        }
        let _ = events.send(DriverEvent::Preview { url, ready });
    }
}

async fn forward_deltas(mut deltas: UnboundedReceiver<String>, events: &UnboundedSender<DriverEvent>) {
    while let Some(text) = deltas.recv().await {
        let _ = events.send(DriverEvent::Delta { text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReadinessConfig};
    use crate::conversation::{PreviewState, SessionStore, TurnPhase};
    use crate::preview::PreviewSettings;
    use crate::sandbox::{CommandOutput, SandboxInfo, SandboxProvider};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    struct ScriptedChat {
        replies: Mutex<VecDeque<anyhow::Result<String>>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<anyhow::Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedChat {
        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            deltas: UnboundedSender<String>,
        ) -> anyhow::Result<String> {
            let reply = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))?;
            for piece in reply.split_inclusive('\n') {
                let _ = deltas.send(piece.to_string());
            }
            Ok(reply)
        }
    }

    /// Sandboxes that never start listening, so the probe always times out
    /// against a closed local port.
    #[derive(Default)]
    struct LocalSandboxes {
        running: Mutex<Vec<String>>,
        fail_create: bool,
        create_delay: Duration,
        creates: Mutex<usize>,
    }

    #[async_trait]
    impl SandboxProvider for LocalSandboxes {
        async fn list_sandboxes(&self) -> anyhow::Result<Vec<SandboxInfo>> {
            Ok(self
                .running
                .lock()
                .iter()
                .map(|id| SandboxInfo {
                    sandbox_id: id.clone(),
                    template_id: None,
                })
                .collect())
        }

        async fn create_sandbox(
            &self,
            _template: &str,
            _timeout_ms: u64,
            _envs: &HashMap<String, String>,
        ) -> anyhow::Result<String> {
            anyhow::ensure!(!self.fail_create, "quota exceeded");
            *self.creates.lock() += 1;
            tokio::time::sleep(self.create_delay).await;
            let mut running = self.running.lock();
            let id = format!("sb-{}", running.len() + 1);
            running.push(id.clone());
            Ok(id)
        }

        async fn connect(&self, _sandbox_id: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn write_file(&self, _id: &str, _path: &str, _content: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run_command(
            &self,
            _id: &str,
            _command: &str,
            _workdir: &str,
            _background: bool,
        ) -> anyhow::Result<CommandOutput> {
            Ok(CommandOutput::default())
        }

        fn host(&self, _sandbox_id: &str, _port: u16) -> String {
            "127.0.0.1:9".to_string()
        }

        fn preview_url(&self, sandbox_id: &str, port: u16) -> String {
            format!("http://{}/?sandbox={sandbox_id}", self.host(sandbox_id, port))
        }
    }

    fn driver(chat: ScriptedChat, sandboxes: LocalSandboxes) -> Driver {
        driver_with(chat, Arc::new(sandboxes))
    }

    fn driver_with(chat: ScriptedChat, sandboxes: Arc<LocalSandboxes>) -> Driver {
        let preview = PreviewService::new(
            sandboxes,
            PreviewSettings::from_config(&Config::default()),
        );
        let probe = ReadinessProbe::new(&ReadinessConfig {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            max_attempts: 1,
            request_timeout_ms: 200,
        })
        .unwrap();
        Driver::new(Arc::new(chat), Arc::new(preview), probe)
    }

    async fn run_turn(driver: &Driver, session: &Arc<Session>, input: &str) -> Vec<DriverEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        match driver.submit(session, input, tx).await.unwrap() {
            TurnOutcome::Deploying(task) => task.await.unwrap(),
            TurnOutcome::NoCode | TurnOutcome::ReplyFailed => {}
        }
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn code_reply_deploys_and_reuses_sandbox() {
        let driver = driver(
            ScriptedChat::new(vec![
                Ok("Sure:\n```python\nprint('v1')\n```".into()),
                Ok("Updated:\n```python\nprint('v2')\n```".into()),
            ]),
            LocalSandboxes::default(),
        );
        let session = SessionStore::new("sys").create();

        let events = run_turn(&driver, &session, "build a counter app").await;
        assert!(events.contains(&DriverEvent::Code {
            code: "print('v1')".into(),
            language: Some("python".into()),
        }));
        assert_eq!(events.last(), Some(&DriverEvent::Done));
        let first = session.snapshot();
        assert_eq!(first.sandbox_id(), Some("sb-1"));
        assert!(matches!(first.preview, PreviewState::Unverified { .. }));

        run_turn(&driver, &session, "make the button red").await;
        let second = session.snapshot();
        assert_eq!(second.sandbox_id(), Some("sb-1"));
        assert_eq!(second.active_code.as_deref(), Some("print('v2')"));
        assert_eq!(second.visible_messages().count(), 4);
    }

    #[tokio::test]
    async fn overlapping_turns_share_one_sandbox() {
        let sandboxes = Arc::new(LocalSandboxes {
            create_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let driver = driver_with(
            ScriptedChat::new(vec![
                Ok("```python\nprint('v1')\n```".into()),
                Ok("```python\nprint('v2')\n```".into()),
            ]),
            sandboxes.clone(),
        );
        let session = SessionStore::new("sys").create();

        // Both replies finish while the first sandbox is still being created.
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = driver.submit(&session, "v1", tx.clone()).await.unwrap();
        let second = driver.submit(&session, "v2", tx).await.unwrap();

        for outcome in [first, second] {
            match outcome {
                TurnOutcome::Deploying(task) => task.await.unwrap(),
                other => panic!("expected a deploy, got {other:?}"),
            }
        }

        assert_eq!(*sandboxes.creates.lock(), 1);
        let state = session.snapshot();
        assert_eq!(state.sandbox_id(), Some("sb-1"));
    }

    #[tokio::test]
    async fn reply_without_code_skips_deploy() {
        let driver = driver(
            ScriptedChat::new(vec![Ok("What should the app do?".into())]),
            LocalSandboxes::default(),
        );
        let session = SessionStore::new("sys").create();

        let events = run_turn(&driver, &session, "hi").await;
        assert!(!events.iter().any(|e| matches!(e, DriverEvent::Code { .. })));
        assert_eq!(session.snapshot().preview, PreviewState::Idle);
        assert_eq!(session.snapshot().phase, TurnPhase::AwaitingUser);
    }

    #[tokio::test]
    async fn stream_failure_becomes_notice_and_keeps_history() {
        let driver = driver(
            ScriptedChat::new(vec![Err(anyhow::anyhow!("connection reset"))]),
            LocalSandboxes::default(),
        );
        let session = SessionStore::new("sys").create();

        let events = run_turn(&driver, &session, "hi").await;
        assert!(events
            .iter()
            .any(|e| matches!(e, DriverEvent::Notice { message } if message.contains("connection reset"))));

        let state = session.snapshot();
        assert_eq!(state.phase, TurnPhase::AwaitingUser);
        assert_eq!(state.visible_messages().count(), 1);
        assert_eq!(state.notices.len(), 1);
    }

    #[tokio::test]
    async fn deploy_failure_is_reported_generically() {
        let driver = driver(
            ScriptedChat::new(vec![Ok("```\nx = 1\n```".into())]),
            LocalSandboxes {
                fail_create: true,
                ..Default::default()
            },
        );
        let session = SessionStore::new("sys").create();

        let events = run_turn(&driver, &session, "go").await;
        assert!(events.contains(&DriverEvent::Notice {
            message: DEPLOY_FAILED.into()
        }));
        assert_eq!(
            session.snapshot().preview,
            PreviewState::Failed {
                message: DEPLOY_FAILED.into()
            }
        );
    }

    #[tokio::test]
    async fn deltas_precede_the_assistant_message() {
        let driver = driver(
            ScriptedChat::new(vec![Ok("line one\nline two".into())]),
            LocalSandboxes::default(),
        );
        let session = SessionStore::new("sys").create();

        let events = run_turn(&driver, &session, "hi").await;
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                DriverEvent::Delta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "line one\nline two");

        let assistant_at = events
            .iter()
            .position(|e| matches!(e, DriverEvent::Message { message } if message.role == Role::Assistant))
            .unwrap();
        let last_delta = events
            .iter()
            .rposition(|e| matches!(e, DriverEvent::Delta { .. }))
            .unwrap();
        assert!(last_delta < assistant_at);
    }

    #[tokio::test]
    async fn second_submit_during_reply_is_rejected() {
        let driver = driver(ScriptedChat::new(vec![]), LocalSandboxes::default());
        let session = SessionStore::new("sys").create();

        driver.begin_turn(&session, "first").unwrap();
        assert_eq!(
            driver.begin_turn(&session, "second").unwrap_err(),
            TransitionError::ReplyInProgress
        );
    }
}
