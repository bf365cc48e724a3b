//! BountyBot: bounty lifecycle scheduling for a Discord space-game bot.
//!
//! Bounties on named criminals are spawned per tech-level division,
//! hunted by players checking systems along the criminal's route, and
//! either captured, timed out, or escaped and later respawned.
//!
//! # Architecture
//!
//! - **Scheduler**: [`scheduler::TaskScheduler`] fires [`scheduler::TimedTask`]s
//!   (spawners, respawns, housekeeping) from a single tokio loop
//! - **Bounties**: the [`bounties::Bounty`] record and its generator
//! - **Databases**: per-guild [`databases::BountyDb`] of temperature-driven divisions
//! - **Channels**: outbound announcements behind [`channels::Announcer`]
//! - **App**: [`AppContext`] ties guilds, persistence and housekeeping together

pub mod app;
pub mod bounties;
pub mod channels;
pub mod config;
pub mod databases;
pub mod error;
pub mod persistence;
pub mod scheduler;

pub use app::AppContext;
pub use config::BotConfig;
pub use error::{BountyError, Result};
