//! Outbound bounty announcements.
//!
//! The bounty core only talks to the [`Announcer`] trait. Discord delivery,
//! log-only output and in-memory capture are interchangeable behind it.

pub mod discord;
pub mod local;
pub mod notices;
pub mod rate_limit;
pub mod traits;

use crate::config::DiscordConfig;
use std::sync::Arc;

pub use discord::DiscordAnnouncer;
pub use local::{LogAnnouncer, MemoryAnnouncer};
pub use notices::{BountyWonNotice, NewBountyNotice};
pub use traits::Announcer;

/// Discord when a bot token is configured, otherwise the log.
pub fn announcer_from_config(config: &DiscordConfig) -> Arc<dyn Announcer> {
    if config.bot_token.trim().is_empty() {
        Arc::new(LogAnnouncer)
    } else {
        Arc::new(DiscordAnnouncer::new(config))
    }
}
