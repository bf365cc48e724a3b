//! Per-guild bounty database: one [`BountyDivision`] per configured band.

use crate::bounties::bounty::Bounty;
use crate::bounties::criminal::Criminal;
use crate::bounties::generator::{BountyConfig, BountyContent, GenerateOptions};
use crate::config::{BotConfig, DivisionBand};
use crate::databases::division::{BountyDivision, DivisionTasks};
use crate::error::{BountyError, Result};
use crate::scheduler::TimedTask;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// All divisions of one guild.
#[derive(Debug)]
pub struct BountyDb {
    divisions: Vec<BountyDivision>,
    lifetime_per_system: Duration,
}

impl BountyDb {
    /// Create one empty division per configured band. `tasks_for` supplies
    /// each division's scheduler handle and callbacks.
    pub fn new<F>(config: &BotConfig, mut tasks_for: F) -> Self
    where
        F: FnMut(&DivisionBand) -> DivisionTasks,
    {
        let divisions = config
            .bounties
            .divisions
            .iter()
            .map(|band| BountyDivision::new(band, config, tasks_for(band)))
            .collect();
        Self {
            divisions,
            lifetime_per_system: Duration::from_secs(config.bounties.duration_per_system_secs),
        }
    }

    pub fn divisions(&self) -> &[BountyDivision] {
        &self.divisions
    }

    pub fn divisions_mut(&mut self) -> &mut [BountyDivision] {
        &mut self.divisions
    }

    /// Division whose band contains `tech_level`.
    pub fn division_for_level(&self, tech_level: u8) -> Result<&BountyDivision> {
        self.divisions
            .iter()
            .find(|d| d.covers_level(tech_level))
            .ok_or_else(|| BountyError::NotFound(format!("a division for tech level {tech_level}")))
    }

    pub fn division_for_level_mut(&mut self, tech_level: u8) -> Result<&mut BountyDivision> {
        self.divisions
            .iter_mut()
            .find(|d| d.covers_level(tech_level))
            .ok_or_else(|| BountyError::NotFound(format!("a division for tech level {tech_level}")))
    }

    /// Division by configured name, case-insensitively.
    pub fn division_for_name(&self, name: &str) -> Result<&BountyDivision> {
        let name = name.trim();
        self.divisions
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| BountyError::NotFound(format!("division '{name}'")))
    }

    pub fn division_for_name_mut(&mut self, name: &str) -> Result<&mut BountyDivision> {
        let name = name.trim();
        self.divisions
            .iter_mut()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| BountyError::NotFound(format!("division '{name}'")))
    }

    /// Returns `true` if the criminal has an active or escaped bounty anywhere.
    pub fn has_criminal(&self, name: &str) -> bool {
        self.divisions.iter().any(|d| d.contains_criminal(name))
    }

    /// Active bounty by criminal name or alias. `level` narrows the search
    /// to one division and tech level.
    pub fn get_bounty(&self, name: &str, level: Option<u8>) -> Result<&Bounty> {
        let found = match level {
            Some(tl) => self.division_for_level(tl)?.get_bounty(name, Some(tl)),
            None => self.divisions.iter().find_map(|d| d.get_bounty(name, None)),
        };
        found.ok_or_else(|| BountyError::NotFound(format!("bounty '{name}'")))
    }

    pub fn get_bounty_for_criminal(&self, criminal: &Criminal) -> Result<&Bounty> {
        self.get_bounty(&criminal.name, None)
    }

    /// Escaped bounty by criminal name or alias.
    pub fn get_escaped_bounty(&self, name: &str, level: Option<u8>) -> Result<&Bounty> {
        let found = match level {
            Some(tl) => self.division_for_level(tl)?.get_escaped_bounty(name, Some(tl)),
            None => self
                .divisions
                .iter()
                .find_map(|d| d.get_escaped_bounty(name, None)),
        };
        found.ok_or_else(|| BountyError::NotFound(format!("escaped bounty '{name}'")))
    }

    /// Name of the division holding an active bounty for `name`.
    pub fn division_of_bounty(&self, name: &str) -> Result<&str> {
        self.divisions
            .iter()
            .find(|d| d.get_bounty(name, None).is_some())
            .map(BountyDivision::name)
            .ok_or_else(|| BountyError::NotFound(format!("bounty '{name}'")))
    }

    /// Insert a bounty into the division covering its tech level.
    ///
    /// # Errors
    ///
    /// - [`BountyError::NotFound`] if no division covers its tech level.
    /// - [`BountyError::Capacity`] if that division is full.
    /// - [`BountyError::Duplicate`] if the criminal is tracked anywhere in the guild.
    pub fn add_bounty(&mut self, bounty: Bounty) -> Result<()> {
        if self.division_for_level(bounty.tech_level())?.is_full() {
            return Err(BountyError::Capacity(format!(
                "division for tech level {} is full",
                bounty.tech_level()
            )));
        }
        if self.has_criminal(bounty.name()) {
            return Err(BountyError::Duplicate(bounty.name().to_owned()));
        }
        self.division_for_level_mut(bounty.tech_level())?
            .add_bounty(bounty)
    }

    /// Remove an active bounty by name or alias.
    pub fn remove_bounty(&mut self, name: &str) -> Result<Bounty> {
        let division = self.division_of_bounty(name)?.to_owned();
        self.division_for_name_mut(&division)?.remove_bounty(name)
    }

    /// Escape an active bounty with the default respawn window.
    pub fn escape_bounty(&mut self, name: &str) -> Result<()> {
        if let Ok(escaped) = self.get_escaped_bounty(name, None) {
            return Err(BountyError::AlreadyEscaped(escaped.name().to_owned()));
        }
        let division = self.division_of_bounty(name)?.to_owned();
        self.division_for_name_mut(&division)?
            .escape_bounty(name, None)
    }

    /// Generate a fresh bounty for `division` and insert it.
    ///
    /// Returns a copy of the inserted bounty.
    pub fn spawn_new_bounty(
        &mut self,
        division: &str,
        content: &dyn BountyContent,
        rng: &mut dyn RngCore,
    ) -> Result<Bounty> {
        let mut config = BountyConfig::default();
        config.generate(
            self,
            division,
            content,
            GenerateOptions::default(),
            self.lifetime_per_system,
            rng,
        )?;
        let bounty = Bounty::from_config(config)?;
        let division = self.division_for_name(division)?;
        if !division.covers_level(bounty.tech_level()) {
            return Err(BountyError::InvalidBounty(format!(
                "generated tech level {} for division {}",
                bounty.tech_level(),
                division.name()
            )));
        }
        let copy = bounty.clone();
        self.add_bounty(bounty)?;
        info!(
            division = division_name(&copy, self),
            criminal = copy.name(),
            tech_level = copy.tech_level(),
            route_len = copy.route().len(),
            "new bounty spawned"
        );
        Ok(copy)
    }

    /// Regenerate an escaped bounty of `division` and make it active again.
    ///
    /// Returns a copy of the respawned bounty.
    pub fn respawn_bounty(
        &mut self,
        division: &str,
        name: &str,
        content: &dyn BountyContent,
        rng: &mut dyn RngCore,
    ) -> Result<Bounty> {
        let escaped = self
            .division_for_name(division)?
            .get_escaped_bounty(name, None)
            .ok_or_else(|| BountyError::NotFound(format!("escaped bounty '{name}'")))?;
        let mut config = BountyConfig::respawn_of(escaped.criminal().clone(), escaped.tech_level());
        let options = GenerateOptions {
            skip_db_check: true,
            ..GenerateOptions::default()
        };
        config.generate(self, division, content, options, self.lifetime_per_system, rng)?;
        let bounty = self
            .division_for_name_mut(division)?
            .respawn_bounty(name, config)?;
        Ok(bounty.clone())
    }

    /// Clear every division. Returns the removed bounties.
    pub fn clear_all(&mut self, include_escaped: bool) -> Vec<Bounty> {
        let removed: Vec<Bounty> = self
            .divisions
            .iter_mut()
            .flat_map(|d| d.clear(include_escaped))
            .collect();
        info!(removed = removed.len(), include_escaped, "all divisions cleared");
        removed
    }

    /// Spawner tasks of every division that has room.
    pub fn new_bounty_tts(&self) -> Vec<Arc<TimedTask>> {
        self.divisions
            .iter()
            .filter(|d| !d.is_full())
            .filter_map(|d| d.new_bounty_tt().cloned())
            .collect()
    }

    /// Decay the temperature of every division.
    pub fn decay_all(&mut self) {
        for division in &mut self.divisions {
            division.decay_temp();
        }
        debug!(
            temperatures = ?self.divisions.iter().map(BountyDivision::temperature).collect::<Vec<_>>(),
            "guild activity decayed"
        );
    }

    /// Escape every overdue active bounty. Returns `(division, bounty)` pairs
    /// holding each bounty as it was before escaping.
    pub fn escape_overdue(&mut self, now: DateTime<Utc>) -> Vec<(String, Bounty)> {
        self.divisions
            .iter_mut()
            .flat_map(|d| {
                let name = d.name().to_owned();
                d.escape_overdue(now)
                    .into_iter()
                    .map(move |b| (name.clone(), b))
            })
            .collect()
    }

    /// Cancel every spawner and respawn task in the guild.
    pub fn cancel_tasks(&mut self) {
        for division in &mut self.divisions {
            division.cancel_tasks();
        }
    }

    /// Bounty lifetime per route system.
    pub fn lifetime_per_system(&self) -> Duration {
        self.lifetime_per_system
    }
}

fn division_name<'a>(bounty: &Bounty, db: &'a BountyDb) -> &'a str {
    db.division_for_level(bounty.tech_level())
        .map(BountyDivision::name)
        .unwrap_or("?")
}
