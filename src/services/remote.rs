use super::{Marketplace, SubmissionError};
use crate::config::MARKETPLACE_API_KEY;
use crate::http::build_client;
use crate::models::{ListingPayload, SubmissionReceipt, UploadMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::warn;

/// Marketplace reached over HTTP: the listing is POSTed as JSON and the
/// response body is the submission receipt.
#[derive(Debug, Clone)]
pub struct HttpMarketplace {
    submit_url: String,
    api_key: Option<String>,
    http: Client,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    listing: &'a ListingPayload,
    upload_mode: UploadMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
}

impl HttpMarketplace {
    pub fn from_env(submit_url: &str) -> Self {
        Self {
            submit_url: submit_url.trim_end_matches('/').to_string(),
            api_key: MARKETPLACE_API_KEY.clone(),
            http: build_client(),
        }
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn submit(
        &self,
        listing: &ListingPayload,
        mode: UploadMode,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let mut request = self.http.post(&self.submit_url).json(&SubmitBody {
            listing,
            upload_mode: mode,
            scheduled_at,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SubmissionError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target = "wizard.marketplace", status = %status, "submission_rejected");
            return Err(SubmissionError::Rejected(format!("HTTP {status}: {body}")));
        }

        response
            .json::<SubmissionReceipt>()
            .await
            .map_err(|err| SubmissionError::Transport(err.to_string()))
    }
}
