//! Bounty records and their generation.

pub mod bounty;
pub mod content;
pub mod criminal;
pub mod generator;

pub use bounty::{Bounty, BountyRecord, CheckResult, RewardShare, ShipLoadout, UserId};
pub use content::StaticContent;
pub use criminal::Criminal;
pub use generator::{BountyConfig, BountyContent, GenerateOptions};
