//! Back-channel logout over HTTP.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::coordinator::RemoteLogout;
use crate::tgt::TicketGrantingTicket;

/// Calls a remote logout URL with the ticket id and user as query parameters.
///
/// Any 2xx response counts as success.
pub struct HttpRemoteLogout {
    url: String,
    http_client: reqwest::Client,
}

impl HttpRemoteLogout {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            http_client,
        })
    }

    fn request_url(&self, ticket: &TicketGrantingTicket) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}ticket={}&user={}",
            self.url,
            separator,
            urlencoding::encode(ticket.id.as_str()),
            urlencoding::encode(&ticket.owner.user_id)
        )
    }
}

#[async_trait]
impl RemoteLogout for HttpRemoteLogout {
    async fn logout(&self, ticket: &TicketGrantingTicket) -> Result<()> {
        let url = self.request_url(ticket);
        debug!(url = %self.url, ticket = %ticket.id, "Sending back-channel logout");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Back-channel logout to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Back-channel logout to {} returned {}", self.url, status);
        }
        Ok(())
    }
}
