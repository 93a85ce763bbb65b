//! Attachment retrieval.

use async_trait::async_trait;

mod gmail;

pub use gmail::GmailAttachmentFetcher;

/// Downloads raw attachment bytes for one message.
///
/// Returns `None` for an attachment that does not exist and for any transport
/// fault; implementations log the reason instead of returning an error.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, message_id: &str, attachment_id: &str) -> Option<Vec<u8>>;
}
