//! Bounty records.
//!
//! A [`Bounty`] hides its criminal in one system (`answer`) of a route.
//! Hunters check systems one at a time; the first check of each system is
//! recorded against the checking user. While a bounty is escaped it holds
//! the [`TimedTask`] that will respawn it.

use crate::bounties::criminal::Criminal;
use crate::bounties::generator::BountyConfig;
use crate::error::{BountyError, Result};
use crate::scheduler::TimedTask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Discord user snowflake.
pub type UserId = u64;

/// Outcome of checking one system for a bounty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CheckResult {
    /// The system is not on the route.
    NotInRoute = 0,
    /// Someone already checked this system.
    AlreadyChecked = 1,
    /// Checked and recorded; the criminal is elsewhere.
    Wrong = 2,
    /// Checked and recorded; the criminal was here.
    Correct = 3,
}

/// Combat loadout a bounty flies with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipLoadout {
    pub hull: String,
    #[serde(default)]
    pub weapons: Vec<String>,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// One hunter's share of a completed bounty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardShare {
    /// Systems this user checked.
    pub checked: u32,
    /// Credits awarded.
    pub reward: u64,
    /// XP awarded.
    pub xp: u64,
    /// Whether this user found the criminal.
    pub won: bool,
}

/// Serializable form of a bounty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BountyRecord {
    pub criminal: Criminal,
    pub route: Vec<String>,
    pub answer: String,
    pub checked: BTreeMap<String, Option<UserId>>,
    pub reward: u64,
    pub reward_per_sys: u64,
    pub issue_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub tech_level: u8,
    #[serde(default)]
    pub active_ship: Option<ShipLoadout>,
    /// Respawn instant while escaped.
    #[serde(default)]
    pub respawn_at: Option<DateTime<Utc>>,
}

/// A spawned criminal record.
#[derive(Debug, Clone)]
pub struct Bounty {
    criminal: Criminal,
    route: Vec<String>,
    answer: String,
    checked: HashMap<String, Option<UserId>>,
    reward: u64,
    reward_per_sys: u64,
    issue_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    tech_level: u8,
    active_ship: Option<ShipLoadout>,
    respawn_task: Option<Arc<TimedTask>>,
}

impl Bounty {
    /// Build a bounty from a fully generated config.
    ///
    /// # Errors
    ///
    /// [`BountyError::InvalidBounty`] if a field is missing or an invariant
    /// fails (answer outside the route, checked keys differ from the route).
    pub fn from_config(config: BountyConfig) -> Result<Self> {
        let missing = |field: &str| BountyError::InvalidBounty(format!("{field} not generated"));
        let criminal = config.criminal.ok_or_else(|| missing("criminal"))?;
        let route = config.route.ok_or_else(|| missing("route"))?;
        let checked = config
            .checked
            .unwrap_or_else(|| route.iter().map(|s| (s.clone(), None)).collect());
        let reward = config.reward.ok_or_else(|| missing("reward"))?;

        let bounty = Self {
            reward_per_sys: per_system_reward(reward, route.len()),
            answer: config.answer.ok_or_else(|| missing("answer"))?,
            issue_time: config.issue_time.ok_or_else(|| missing("issue time"))?,
            end_time: config.end_time.ok_or_else(|| missing("end time"))?,
            tech_level: config.tech_level.ok_or_else(|| missing("tech level"))?,
            active_ship: config.active_ship,
            criminal,
            route,
            checked,
            reward,
            respawn_task: None,
        };
        bounty.validate()?;
        Ok(bounty)
    }

    /// Rebuild a bounty from its persisted form. The respawn task is not restored.
    pub fn from_record(record: BountyRecord) -> Result<Self> {
        let bounty = Self {
            criminal: record.criminal,
            route: record.route,
            answer: record.answer,
            checked: record.checked.into_iter().collect(),
            reward: record.reward,
            reward_per_sys: record.reward_per_sys,
            issue_time: record.issue_time,
            end_time: record.end_time,
            tech_level: record.tech_level,
            active_ship: record.active_ship,
            respawn_task: None,
        };
        bounty.validate()?;
        Ok(bounty)
    }

    /// Snapshot for persistence. The respawn task is stored as its expiry instant.
    pub fn to_record(&self) -> BountyRecord {
        BountyRecord {
            criminal: self.criminal.clone(),
            route: self.route.clone(),
            answer: self.answer.clone(),
            checked: self.checked.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            reward: self.reward,
            reward_per_sys: self.reward_per_sys,
            issue_time: self.issue_time,
            end_time: self.end_time,
            tech_level: self.tech_level,
            active_ship: self.active_ship.clone(),
            respawn_at: self.respawn_task.as_ref().map(|t| t.expiry_time()),
        }
    }

    fn validate(&self) -> Result<()> {
        let name = &self.criminal.name;
        if self.route.is_empty() {
            return Err(BountyError::InvalidBounty(format!("{name} has an empty route")));
        }
        if !self.route.contains(&self.answer) {
            return Err(BountyError::InvalidBounty(format!(
                "answer {} is not on {name}'s route",
                self.answer
            )));
        }
        let unique: std::collections::HashSet<&String> = self.route.iter().collect();
        if unique.len() != self.route.len() {
            return Err(BountyError::InvalidBounty(format!(
                "{name}'s route visits a system twice"
            )));
        }
        if self.checked.len() != self.route.len()
            || !self.route.iter().all(|s| self.checked.contains_key(s))
        {
            return Err(BountyError::InvalidBounty(format!(
                "{name}'s checked systems do not match the route"
            )));
        }
        Ok(())
    }

    /// Replace route, reward, answer and timings with a fresh generation,
    /// keeping the criminal and any respawn task. Used when an escaped
    /// bounty respawns.
    pub fn regenerate(&mut self, config: BountyConfig) -> Result<()> {
        if let Some(c) = &config.criminal
            && c != &self.criminal
        {
            return Err(BountyError::InvalidBounty(format!(
                "cannot regenerate {} as {}",
                self.criminal, c
            )));
        }
        let mut config = config;
        config.criminal = Some(self.criminal.clone());
        config.tech_level = config.tech_level.or(Some(self.tech_level));
        let mut fresh = Self::from_config(config)?;
        fresh.respawn_task = self.respawn_task.take();
        *self = fresh;
        Ok(())
    }

    pub fn criminal(&self) -> &Criminal {
        &self.criminal
    }

    /// Canonical criminal name, the bounty's key within a guild.
    pub fn name(&self) -> &str {
        &self.criminal.name
    }

    /// Systems the criminal may be hiding in, in travel order.
    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Who checked `system`, if anyone. `None` for systems off the route too.
    pub fn checked_by(&self, system: &str) -> Option<UserId> {
        self.checked.get(system).copied().flatten()
    }

    /// First checker of every route system, `None` while unchecked.
    pub fn checked(&self) -> &HashMap<String, Option<UserId>> {
        &self.checked
    }

    pub fn reward(&self) -> u64 {
        self.reward
    }

    /// What a non-winning hunter earns for each system they checked.
    pub fn reward_per_sys(&self) -> u64 {
        self.reward_per_sys
    }

    pub fn issue_time(&self) -> DateTime<Utc> {
        self.issue_time
    }

    /// Instant after which the bounty is overdue and escapes on the next sweep.
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn tech_level(&self) -> u8 {
        self.tech_level
    }

    pub fn active_ship(&self) -> Option<&ShipLoadout> {
        self.active_ship.as_ref()
    }

    pub fn equip_ship(&mut self, ship: ShipLoadout) {
        self.active_ship = Some(ship);
    }

    pub fn unequip_ship(&mut self) -> Option<ShipLoadout> {
        self.active_ship.take()
    }

    /// Returns `true` once `now` reaches the end time.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Check `system` on behalf of `user`.
    ///
    /// System names match case-insensitively. Only the first check of a
    /// system is recorded.
    pub fn check(&mut self, system: &str, user: UserId) -> CheckResult {
        let Some(system) = self
            .route
            .iter()
            .find(|s| s.eq_ignore_ascii_case(system.trim()))
            .cloned()
        else {
            return CheckResult::NotInRoute;
        };

        match self.checked.get_mut(&system) {
            Some(Some(_)) => CheckResult::AlreadyChecked,
            Some(slot) => {
                *slot = Some(user);
                if system == self.answer {
                    CheckResult::Correct
                } else {
                    CheckResult::Wrong
                }
            }
            None => CheckResult::NotInRoute,
        }
    }

    /// Split the reward pool between everyone who checked a system.
    ///
    /// Non-winners get `reward_per_sys` per system checked. The user who
    /// checked the answer takes whatever is left. If nobody checked the
    /// answer, contributors are still paid per system and the rest of the
    /// pool is forfeit. XP is each user's credits times `xp_per_credit`.
    pub fn calc_rewards(&self, xp_per_credit: f64) -> HashMap<UserId, RewardShare> {
        let mut shares: HashMap<UserId, RewardShare> = HashMap::new();
        for user in self.checked.values().flatten() {
            shares
                .entry(*user)
                .or_insert(RewardShare {
                    checked: 0,
                    reward: 0,
                    xp: 0,
                    won: false,
                })
                .checked += 1;
        }

        let winner = self.checked_by(&self.answer);
        let mut paid: u64 = 0;
        for (user, share) in shares.iter_mut() {
            if Some(*user) == winner {
                continue;
            }
            share.reward = self.reward_per_sys.saturating_mul(u64::from(share.checked));
            paid = paid.saturating_add(share.reward);
        }
        if let Some(winner) = winner
            && let Some(share) = shares.get_mut(&winner)
        {
            share.reward = self.reward.saturating_sub(paid);
            share.won = true;
        }

        for share in shares.values_mut() {
            share.xp = (share.reward as f64 * xp_per_credit).round() as u64;
        }
        shares
    }

    /// Default escape window: `per_system` for every system on the route.
    pub fn respawn_delay(&self, per_system: Duration) -> Duration {
        per_system.saturating_mul(u32::try_from(self.route.len()).unwrap_or(u32::MAX))
    }

    pub fn is_escaped(&self) -> bool {
        self.respawn_task.is_some()
    }

    /// Task that brings an escaped bounty back. `None` while active.
    pub fn respawn_task(&self) -> Option<&Arc<TimedTask>> {
        self.respawn_task.as_ref()
    }

    /// Enter the escaped state, holding `respawn_task` until respawn.
    ///
    /// # Errors
    ///
    /// [`BountyError::AlreadyEscaped`] if the bounty is already escaped.
    pub fn escape(&mut self, respawn_task: Arc<TimedTask>) -> Result<()> {
        if self.respawn_task.is_some() {
            return Err(BountyError::AlreadyEscaped(self.criminal.name.clone()));
        }
        self.respawn_task = Some(respawn_task);
        Ok(())
    }

    /// Leave the escaped state, returning the respawn task.
    pub fn take_respawn_task(&mut self) -> Option<Arc<TimedTask>> {
        self.respawn_task.take()
    }
}

fn per_system_reward(reward: u64, route_len: usize) -> u64 {
    let len = u64::try_from(route_len).unwrap_or(u64::MAX).max(1);
    reward / len
}
