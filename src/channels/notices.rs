//! Announcement payloads.

use crate::bounties::bounty::{Bounty, RewardShare, UserId};
use crate::databases::division::BountyDivision;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;

/// A bounty was spawned or respawned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBountyNotice {
    pub guild_id: u64,
    pub division: String,
    /// Division bounty board, else the guild announce channel.
    pub channel_id: Option<u64>,
    pub alert_role_id: Option<u64>,
    pub criminal: String,
    pub faction: String,
    pub tech_level: u8,
    pub route: Vec<String>,
    pub reward: u64,
    pub end_time: DateTime<Utc>,
    pub respawned: bool,
}

impl NewBountyNotice {
    pub fn new(
        guild_id: u64,
        division: &BountyDivision,
        bounty: &Bounty,
        fallback_channel: Option<u64>,
        respawned: bool,
    ) -> Self {
        Self {
            guild_id,
            division: division.name().to_owned(),
            channel_id: division.bounty_board_channel().or(fallback_channel),
            alert_role_id: division.alert_role_id(),
            criminal: bounty.name().to_owned(),
            faction: bounty.criminal().faction.clone(),
            tech_level: bounty.tech_level(),
            route: bounty.route().to_vec(),
            reward: bounty.reward(),
            end_time: bounty.end_time(),
            respawned,
        }
    }

    /// Discord message text.
    pub fn render(&self) -> String {
        let mut text = String::new();
        if let Some(role) = self.alert_role_id {
            let _ = write!(text, "<@&{role}> ");
        }
        let verb = if self.respawned { "is back" } else { "is wanted" };
        let _ = write!(
            text,
            "**{}** ({}, TL{}) {verb} in the {} division!\nRoute: {}\nReward: {} credits. Expires <t:{}:R>.",
            self.criminal,
            self.faction,
            self.tech_level,
            self.division,
            self.route.join(" > "),
            self.reward,
            self.end_time.timestamp(),
        );
        text
    }
}

/// A bounty was captured, or ran out of time with contributors to pay.
#[derive(Debug, Clone, PartialEq)]
pub struct BountyWonNotice {
    pub guild_id: u64,
    pub division: String,
    pub channel_id: Option<u64>,
    pub criminal: String,
    pub reward: u64,
    /// User who checked the answer system. `None` when the bounty escaped.
    pub winner: Option<UserId>,
    /// Payouts, largest first.
    pub shares: Vec<(UserId, RewardShare)>,
}

impl BountyWonNotice {
    pub fn new(
        guild_id: u64,
        division: &BountyDivision,
        bounty: &Bounty,
        shares: &HashMap<UserId, RewardShare>,
        fallback_channel: Option<u64>,
    ) -> Self {
        let mut shares: Vec<(UserId, RewardShare)> =
            shares.iter().map(|(user, share)| (*user, *share)).collect();
        shares.sort_by(|a, b| b.1.reward.cmp(&a.1.reward).then(a.0.cmp(&b.0)));
        Self {
            guild_id,
            division: division.name().to_owned(),
            channel_id: division.bounty_board_channel().or(fallback_channel),
            criminal: bounty.name().to_owned(),
            reward: bounty.reward(),
            winner: shares.iter().find(|(_, s)| s.won).map(|(user, _)| *user),
            shares,
        }
    }

    pub fn render(&self) -> String {
        let mut text = match self.winner {
            Some(winner) => format!(
                "<@{winner}> located **{}** and claimed the bounty!",
                self.criminal
            ),
            None => format!("**{}** slipped away before anyone found them.", self.criminal),
        };
        for (user, share) in &self.shares {
            let _ = write!(
                text,
                "\n<@{user}>: {} credits, {} XP ({} system{} checked)",
                share.reward,
                share.xp,
                share.checked,
                if share.checked == 1 { "" } else { "s" }
            );
        }
        text
    }
}
