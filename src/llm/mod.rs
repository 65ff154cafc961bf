//! Chat completion providers.
//!
//! The conversation driver only needs one operation: stream a reply to a
//! message history, forwarding text pieces as they arrive.

pub mod openai;

pub use openai::OpenAiChatClient;

use crate::conversation::ChatMessage;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream the assistant reply to `messages`. Each text piece is sent on
    /// `deltas` as it arrives; the complete reply is returned at the end.
    ///
    /// A closed `deltas` receiver does not abort the stream.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        deltas: UnboundedSender<String>,
    ) -> anyhow::Result<String>;
}
