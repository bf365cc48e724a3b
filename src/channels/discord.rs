//! Discord REST announcer.
//!
//! Announcements are plain channel messages. Each channel is budgeted by a
//! local sliding window, and a 429 from Discord holds the channel for the
//! `Retry-After` the server sends back.

use crate::channels::notices::{BountyWonNotice, NewBountyNotice};
use crate::channels::rate_limit::ChannelRateLimiters;
use crate::channels::traits::Announcer;
use crate::config::DiscordConfig;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const DISCORD_API: &str = "https://discord.com/api/v10";

/// Posts bounty announcements through the Discord REST API.
pub struct DiscordAnnouncer {
    bot_token: String,
    api_base: String,
    limiters: Mutex<ChannelRateLimiters>,
    client: reqwest::Client,
}

impl DiscordAnnouncer {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            api_base: DISCORD_API.to_owned(),
            limiters: Mutex::new(ChannelRateLimiters::new(config.messages_per_minute)),
            client: reqwest::Client::new(),
        }
    }

    /// Send requests to another API root.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    async fn send(&self, channel_id: Option<u64>, text: String) -> anyhow::Result<()> {
        let Some(channel_id) = channel_id else {
            debug!("no announce channel configured, skipping message");
            return Ok(());
        };
        if self.bot_token.trim().is_empty() {
            anyhow::bail!("discord bot token is empty");
        }
        self.limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_send(channel_id)?;

        let url = format!("{}/channels/{channel_id}/messages", self.api_base);
        let body = json!({
            "content": text,
            "allowed_mentions": { "parse": ["roles", "users"] }
        });
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&body)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            self.limiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .hold(channel_id, retry_after);
            anyhow::bail!(
                "discord rate limited channel {channel_id}; retry after {:.1}s",
                retry_after.as_secs_f64()
            );
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("discord send failed ({status}): {body}");
        }
        Ok(())
    }
}

/// The `Retry-After` header in seconds, one second when absent or garbled.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map_or(Duration::from_secs(1), Duration::from_secs_f64)
}

#[async_trait]
impl Announcer for DiscordAnnouncer {
    fn id(&self) -> &'static str {
        "discord"
    }

    async fn announce_new_bounty(&self, notice: &NewBountyNotice) -> anyhow::Result<()> {
        self.send(notice.channel_id, notice.render()).await
    }

    async fn announce_bounty_won(&self, notice: &BountyWonNotice) -> anyhow::Result<()> {
        self.send(notice.channel_id, notice.render()).await
    }
}
