//! Announcers that stay inside the process.

use crate::channels::notices::{BountyWonNotice, NewBountyNotice};
use crate::channels::traits::Announcer;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Writes announcements to the log. Used when no Discord token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    fn id(&self) -> &'static str {
        "log"
    }

    async fn announce_new_bounty(&self, notice: &NewBountyNotice) -> anyhow::Result<()> {
        info!(
            guild_id = notice.guild_id,
            division = %notice.division,
            criminal = %notice.criminal,
            tech_level = notice.tech_level,
            reward = notice.reward,
            respawned = notice.respawned,
            "{}",
            notice.render()
        );
        Ok(())
    }

    async fn announce_bounty_won(&self, notice: &BountyWonNotice) -> anyhow::Result<()> {
        info!(
            guild_id = notice.guild_id,
            division = %notice.division,
            criminal = %notice.criminal,
            winner = ?notice.winner,
            "{}",
            notice.render()
        );
        Ok(())
    }
}

/// Keeps every announcement in memory.
#[derive(Debug, Default)]
pub struct MemoryAnnouncer {
    new_bounties: Mutex<Vec<NewBountyNotice>>,
    bounties_won: Mutex<Vec<BountyWonNotice>>,
}

impl MemoryAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_bounties(&self) -> Vec<NewBountyNotice> {
        self.new_bounties
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn bounties_won(&self) -> Vec<BountyWonNotice> {
        self.bounties_won
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Announcer for MemoryAnnouncer {
    fn id(&self) -> &'static str {
        "memory"
    }

    async fn announce_new_bounty(&self, notice: &NewBountyNotice) -> anyhow::Result<()> {
        self.new_bounties
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
        Ok(())
    }

    async fn announce_bounty_won(&self, notice: &BountyWonNotice) -> anyhow::Result<()> {
        self.bounties_won
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice.clone());
        Ok(())
    }
}
