use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::AttachmentFetcher;

// Gmail hands out base64url, sometimes padded and sometimes not.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("invalid Gmail API url: {0}")]
    Url(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("attachment response has no data")]
    EmptyData,

    #[error("attachment data is not base64url: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Deserialize)]
struct AttachmentBody {
    #[serde(default)]
    data: Option<String>,
}

/// Fetches attachments through `users.messages.attachments.get`.
#[derive(Clone)]
pub struct GmailAttachmentFetcher {
    client: reqwest::Client,
    api_base: String,
    access_token: Option<String>,
}

impl GmailAttachmentFetcher {
    pub fn new(
        api_base: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            access_token,
        })
    }

    fn attachment_url(&self, message_id: &str, attachment_id: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| FetchError::Url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Url(format!("{} cannot be a base", self.api_base)))?
            .pop_if_empty()
            .extend([
                "gmail",
                "v1",
                "users",
                "me",
                "messages",
                message_id,
                "attachments",
                attachment_id,
            ]);
        Ok(url)
    }

    async fn try_fetch(
        &self,
        token: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        let url = self.attachment_url(message_id, attachment_id)?;

        let resp = self.client.get(url).bearer_auth(token).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: AttachmentBody = resp.error_for_status()?.json().await?;
        let data = body
            .data
            .filter(|d| !d.is_empty())
            .ok_or(FetchError::EmptyData)?;

        Ok(Some(decode_attachment_data(&data)?))
    }
}

fn decode_attachment_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    GMAIL_BASE64.decode(data.trim())
}

#[async_trait]
impl AttachmentFetcher for GmailAttachmentFetcher {
    async fn fetch(&self, message_id: &str, attachment_id: &str) -> Option<Vec<u8>> {
        let Some(token) = self.access_token.as_deref() else {
            warn!(
                message_id,
                attachment_id, "no Gmail access token configured, skipping attachment"
            );
            return None;
        };

        info!(message_id, attachment_id, "fetching attachment");
        match self.try_fetch(token, message_id, attachment_id).await {
            Ok(Some(bytes)) => {
                debug!(message_id, attachment_id, bytes = bytes.len(), "attachment fetched");
                Some(bytes)
            }
            Ok(None) => {
                warn!(message_id, attachment_id, "attachment not found");
                None
            }
            Err(e) => {
                warn!(message_id, attachment_id, error = %e, "attachment fetch failed");
                None
            }
        }
    }
}
