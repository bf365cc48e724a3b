//! Bounty generation orchestration.
//!
//! [`BountyConfig`] is a partially specified bounty. [`BountyConfig::generate`]
//! fills every missing field from a [`BountyContent`] collaborator and the
//! target division, checking the guild's uniqueness and capacity rules on
//! the way. Fields that were given explicitly are validated, not replaced.

use crate::bounties::bounty::{ShipLoadout, UserId};
use crate::bounties::criminal::Criminal;
use crate::databases::bounty_db::BountyDb;
use crate::error::{BountyError, Result};
use crate::scheduler::task::instant_after;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::time::Duration;

/// Game content the generator draws from.
pub trait BountyContent: Send + Sync {
    /// Every criminal that may be issued a bounty.
    fn criminals(&self) -> &[Criminal];

    /// Random system suitable as a route endpoint at `tech_level`.
    fn random_system(&self, tech_level: u8, rng: &mut dyn RngCore) -> Option<String>;

    /// Route from `start` to `end`, both inclusive.
    ///
    /// # Errors
    ///
    /// [`BountyError::NotFound`] if either system is unknown or unreachable.
    fn find_route(&self, start: &str, end: &str) -> Result<Vec<String>>;

    fn has_system(&self, name: &str) -> bool;

    /// Total credit pool for a route of `route_len` systems.
    fn reward_for(&self, route_len: usize, tech_level: u8) -> u64;

    /// Ship the bounty flies at `tech_level`, if any.
    fn ship_for(&self, tech_level: u8, rng: &mut dyn RngCore) -> Option<ShipLoadout>;
}

/// Switches for [`BountyConfig::generate`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    /// Keep an explicitly given `checked` map instead of resetting it.
    pub keep_checked: bool,
    /// Skip the guild-wide duplicate criminal check. Used when regenerating
    /// a bounty that is already tracked.
    pub skip_db_check: bool,
}

/// A bounty under construction. `None` fields are generated.
#[derive(Debug, Clone, Default)]
pub struct BountyConfig {
    pub criminal: Option<Criminal>,
    pub tech_level: Option<u8>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub route: Option<Vec<String>>,
    pub answer: Option<String>,
    pub checked: Option<HashMap<String, Option<UserId>>>,
    pub reward: Option<u64>,
    pub issue_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub active_ship: Option<ShipLoadout>,
}

impl BountyConfig {
    /// Config that regenerates everything but `criminal` at `tech_level`.
    pub fn respawn_of(criminal: Criminal, tech_level: u8) -> Self {
        Self {
            criminal: Some(criminal),
            tech_level: Some(tech_level),
            ..Self::default()
        }
    }

    /// Fill every missing field for a bounty in `division`.
    ///
    /// `lifetime_per_system` sets the end time when none was given.
    ///
    /// # Errors
    ///
    /// - [`BountyError::NotFound`]: unknown division, system, or no route.
    /// - [`BountyError::Capacity`]: a tech level must be picked but the
    ///   division is full, or no unused criminal is left.
    /// - [`BountyError::Duplicate`]: the criminal is already tracked.
    /// - [`BountyError::InvalidBounty`]: explicit fields contradict each other.
    pub fn generate(
        &mut self,
        db: &BountyDb,
        division: &str,
        content: &dyn BountyContent,
        options: GenerateOptions,
        lifetime_per_system: Duration,
        rng: &mut dyn RngCore,
    ) -> Result<()> {
        let div = db.division_for_name(division)?;

        match &self.criminal {
            Some(criminal) if !options.skip_db_check && db.has_criminal(&criminal.name) => {
                return Err(BountyError::Duplicate(criminal.name.clone()));
            }
            Some(_) => {}
            None => {
                let unused: Vec<&Criminal> = content
                    .criminals()
                    .iter()
                    .filter(|c| !db.has_criminal(&c.name))
                    .collect();
                let picked = unused.choose(rng).ok_or_else(|| {
                    BountyError::Capacity("every criminal already has a bounty".to_owned())
                })?;
                self.criminal = Some((*picked).clone());
            }
        }

        let tech_level = match self.tech_level {
            Some(tl) if !div.covers_level(tl) => {
                return Err(BountyError::InvalidBounty(format!(
                    "tech level {tl} is outside division {division}"
                )));
            }
            Some(tl) => tl,
            None => div.pick_new_tl(rng)?,
        };
        self.tech_level = Some(tech_level);

        if self.route.is_none() {
            self.route = Some(self.generate_route(content, tech_level, rng)?);
        }
        let route = self.route.as_deref().unwrap_or_default();
        if route.is_empty() {
            return Err(BountyError::InvalidBounty("route is empty".to_owned()));
        }
        if let Some(unknown) = route.iter().find(|s| !content.has_system(s)) {
            return Err(BountyError::NotFound(format!("system '{unknown}'")));
        }

        match &self.answer {
            Some(answer) if !route.contains(answer) => {
                return Err(BountyError::InvalidBounty(format!(
                    "answer {answer} is not on the route"
                )));
            }
            Some(_) => {}
            None => self.answer = route.choose(rng).cloned(),
        }

        let keep = options.keep_checked
            && self
                .checked
                .as_ref()
                .is_some_and(|c| c.len() == route.len() && route.iter().all(|s| c.contains_key(s)));
        if options.keep_checked && self.checked.is_some() && !keep {
            return Err(BountyError::InvalidBounty(
                "checked systems do not match the route".to_owned(),
            ));
        }
        if !keep {
            self.checked = Some(route.iter().map(|s| (s.clone(), None)).collect());
        }

        let route_len = route.len();
        if self.reward.is_none() {
            self.reward = Some(content.reward_for(route_len, tech_level));
        }
        let issue_time = *self.issue_time.get_or_insert_with(Utc::now);
        if self.end_time.is_none() {
            let lifetime =
                lifetime_per_system.saturating_mul(u32::try_from(route_len).unwrap_or(u32::MAX));
            self.end_time = Some(instant_after(issue_time, lifetime)?);
        }
        if self.active_ship.is_none() {
            self.active_ship = content.ship_for(tech_level, rng);
        }
        Ok(())
    }

    fn generate_route(
        &self,
        content: &dyn BountyContent,
        tech_level: u8,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<String>> {
        let no_system = || BountyError::NotFound(format!("a system for tech level {tech_level}"));

        let start = match &self.start {
            Some(s) => s.clone(),
            None => content
                .random_system(tech_level, rng)
                .ok_or_else(no_system)?,
        };
        let end = match &self.end {
            Some(e) => e.clone(),
            None => {
                // A handful of attempts at a distinct endpoint; single-system
                // routes are allowed if the content offers nothing else.
                let mut end = content
                    .random_system(tech_level, rng)
                    .ok_or_else(no_system)?;
                for _ in 0..8 {
                    if end != start {
                        break;
                    }
                    end = content
                        .random_system(tech_level, rng)
                        .ok_or_else(no_system)?;
                }
                end
            }
        };
        content.find_route(&start, &end)
    }
}
