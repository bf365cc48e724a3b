//! Configuration types for the bounty scheduling core.

use crate::error::{BountyError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bounty board shape: tech levels, divisions, lifetimes.
    pub bounties: BountiesConfig,
    /// Guild activity ("temperature") tuning.
    pub activity: ActivityConfig,
    /// New-bounty spawn cadence.
    pub spawn: SpawnConfig,
    /// Timed task checking strategy.
    pub timed_tasks: TimedTaskConfig,
    /// Where and how often state is saved.
    pub persistence: PersistenceConfig,
    /// Discord connection and announcement settings.
    pub discord: DiscordConfig,
}

/// A named tech-level band. One division per band is created in every guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionBand {
    /// Division name shown to users (e.g. `"rookie"`).
    pub name: String,
    /// Lowest tech level in the band (inclusive).
    pub min_level: u8,
    /// Highest tech level in the band (inclusive).
    pub max_level: u8,
}

impl DivisionBand {
    pub fn new(name: impl Into<String>, min_level: u8, max_level: u8) -> Self {
        Self {
            name: name.into(),
            min_level,
            max_level,
        }
    }

    /// Returns `true` if `tech_level` falls inside this band.
    pub fn contains(&self, tech_level: u8) -> bool {
        (self.min_level..=self.max_level).contains(&tech_level)
    }
}

/// Bounty board configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BountiesConfig {
    /// Lowest tech level a bounty can have.
    pub min_tech_level: u8,
    /// Highest tech level a bounty can have.
    pub max_tech_level: u8,
    /// Hard cap on bounties (active + escaped) per division.
    pub max_bounties_per_division: usize,
    /// Division bands, in ascending tech-level order.
    pub divisions: Vec<DivisionBand>,
    /// Bounty lifetime granted per system in its route.
    pub duration_per_system_secs: u64,
    /// Escape window granted per system in the escaped bounty's route.
    pub escape_respawn_secs_per_system: u64,
    /// XP awarded per credit of reward.
    pub xp_per_credit: f64,
    /// How often overdue bounties are swept off the board.
    pub sweep_interval_secs: u64,
}

impl Default for BountiesConfig {
    fn default() -> Self {
        Self {
            min_tech_level: 1,
            max_tech_level: 10,
            max_bounties_per_division: 5,
            divisions: vec![
                DivisionBand::new("rookie", 1, 3),
                DivisionBand::new("veteran", 4, 6),
                DivisionBand::new("elite", 7, 10),
            ],
            duration_per_system_secs: 3600,
            escape_respawn_secs_per_system: 60,
            xp_per_credit: 0.1,
            sweep_interval_secs: 300,
        }
    }
}

/// Guild activity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Temperature floor; a division at the floor is inactive.
    pub min_guild_activity: f64,
    /// Multiplier applied on each decay pass.
    pub guild_activity_decay_rate: f64,
    /// Interval between decay passes.
    pub decay_interval_secs: u64,
    /// Temperature added to a division for each hunting check.
    pub check_heat: f64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            min_guild_activity: 1.0,
            guild_activity_decay_rate: 0.9,
            decay_interval_secs: 3600,
            check_heat: 1.0,
        }
    }
}

/// Algorithm used to pick the delay before a division's next bounty spawn.
///
/// Route-scaled variants multiply the base delay by the route length of the
/// division's latest bounty (or `fallback_route_len` before the first spawn)
/// and by `coefficient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NewBountyDelay {
    /// Constant delay.
    Fixed { secs: u64 },
    /// Uniformly random delay between `min_secs` and `max_secs`.
    Random { min_secs: u64, max_secs: u64 },
    /// Constant delay scaled by the latest route length.
    FixedRouteScale {
        secs: u64,
        coefficient: f64,
        fallback_route_len: usize,
    },
    /// Random delay scaled by the latest route length.
    RandomRouteScale {
        min_secs: u64,
        max_secs: u64,
        coefficient: f64,
        fallback_route_len: usize,
    },
    /// As `RandomRouteScale`, additionally scaled by `temperature^-0.1`.
    RandomRouteScaleTempScale {
        min_secs: u64,
        max_secs: u64,
        coefficient: f64,
        fallback_route_len: usize,
    },
}

impl Default for NewBountyDelay {
    fn default() -> Self {
        Self::RandomRouteScaleTempScale {
            min_secs: 60,
            max_secs: 300,
            coefficient: 1.0,
            fallback_route_len: 5,
        }
    }
}

/// New-bounty spawner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Delay algorithm between spawns.
    pub new_bounty_delay: NewBountyDelay,
    /// Delay before retrying a failed spawn or respawn.
    pub failure_retry_secs: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            new_bounty_delay: NewBountyDelay::default(),
            failure_retry_secs: 60,
        }
    }
}

/// How the scheduler finds expired tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckingType {
    /// Poll every task once per lateness threshold.
    Fixed,
    /// Sleep until the soonest expiry, re-arming whenever the task set changes.
    #[default]
    Dynamic,
}

/// Timed task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimedTaskConfig {
    /// Checking strategy.
    pub checking_type: CheckingType,
    /// Maximum lateness tolerated by fixed polling.
    pub lateness_threshold_secs: u64,
}

impl Default for TimedTaskConfig {
    fn default() -> Self {
        Self {
            checking_type: CheckingType::Dynamic,
            lateness_threshold_secs: 10,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// State file path (None = platform data dir).
    pub state_path: Option<PathBuf>,
    /// Interval between autosaves. Zero disables autosave.
    pub autosave_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            autosave_interval_secs: 300,
        }
    }
}

impl PersistenceConfig {
    /// Configured state path, or `<data dir>/bountybot/state.json`.
    pub fn resolved_state_path(&self) -> PathBuf {
        if let Some(path) = &self.state_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bountybot")
            .join("state.json")
    }
}

/// Per-guild Discord settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    /// Discord guild ID.
    pub guild_id: u64,
    /// Channel that receives announcements when a division has no board.
    #[serde(default)]
    pub announce_channel_id: Option<u64>,
}

/// Discord configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Bot token. Empty disables Discord announcements.
    pub bot_token: String,
    /// Guilds with bounties enabled at startup.
    pub guilds: Vec<GuildConfig>,
    /// Outbound message budget per channel.
    pub messages_per_minute: u32,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            guilds: Vec::new(),
            messages_per_minute: 20,
        }
    }
}

impl DiscordConfig {
    /// Announce channel configured for `guild_id`, if any.
    pub fn announce_channel(&self, guild_id: u64) -> Option<u64> {
        self.guilds
            .iter()
            .find(|g| g.guild_id == guild_id)
            .and_then(|g| g.announce_channel_id)
    }
}

impl BotConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| BountyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| BountyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/bountybot/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("bountybot")
            .join("config.toml")
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let b = &self.bounties;
        if b.min_tech_level > b.max_tech_level {
            return Err(BountyError::Config(format!(
                "min_tech_level {} exceeds max_tech_level {}",
                b.min_tech_level, b.max_tech_level
            )));
        }
        if b.max_bounties_per_division == 0 {
            return Err(BountyError::Config(
                "max_bounties_per_division must be at least 1".to_owned(),
            ));
        }
        if b.divisions.is_empty() {
            return Err(BountyError::Config("no divisions configured".to_owned()));
        }

        let mut expected_min = b.min_tech_level;
        for band in &b.divisions {
            if band.min_level > band.max_level {
                return Err(BountyError::Config(format!(
                    "division '{}' has an empty range {}..={}",
                    band.name, band.min_level, band.max_level
                )));
            }
            if band.min_level != expected_min {
                return Err(BountyError::Config(format!(
                    "division '{}' starts at {} but tech level {} is next",
                    band.name, band.min_level, expected_min
                )));
            }
            expected_min = band.max_level.saturating_add(1);
        }
        let covered_max = b.divisions.last().map(|d| d.max_level).unwrap_or_default();
        if covered_max != b.max_tech_level {
            return Err(BountyError::Config(format!(
                "divisions end at tech level {covered_max}, expected {}",
                b.max_tech_level
            )));
        }

        let names: std::collections::HashSet<&str> =
            b.divisions.iter().map(|d| d.name.as_str()).collect();
        if names.len() != b.divisions.len() {
            return Err(BountyError::Config("division names must be unique".to_owned()));
        }

        let a = &self.activity;
        if !(a.guild_activity_decay_rate > 0.0 && a.guild_activity_decay_rate <= 1.0) {
            return Err(BountyError::Config(format!(
                "guild_activity_decay_rate {} must be in (0, 1]",
                a.guild_activity_decay_rate
            )));
        }
        if a.min_guild_activity <= 0.0 {
            return Err(BountyError::Config(
                "min_guild_activity must be positive".to_owned(),
            ));
        }

        for (field, secs) in [
            ("bounties.sweep_interval_secs", b.sweep_interval_secs),
            ("activity.decay_interval_secs", a.decay_interval_secs),
            ("spawn.failure_retry_secs", self.spawn.failure_retry_secs),
        ] {
            if secs == 0 {
                return Err(BountyError::Config(format!("{field} must be at least 1")));
            }
        }

        match &self.spawn.new_bounty_delay {
            NewBountyDelay::Random { min_secs, max_secs }
            | NewBountyDelay::RandomRouteScale {
                min_secs, max_secs, ..
            }
            | NewBountyDelay::RandomRouteScaleTempScale {
                min_secs, max_secs, ..
            } if min_secs > max_secs => Err(BountyError::Config(format!(
                "new_bounty_delay min_secs {min_secs} exceeds max_secs {max_secs}"
            ))),
            _ => Ok(()),
        }
    }

    /// Band containing `tech_level`, if any.
    pub fn band_for_level(&self, tech_level: u8) -> Option<&DivisionBand> {
        self.bounties.divisions.iter().find(|d| d.contains(tech_level))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        BotConfig::default().validate().expect("default config validates");
    }

    #[test]
    fn default_bands_cover_all_levels() {
        let config = BotConfig::default();
        for tl in 1..=10 {
            assert!(config.band_for_level(tl).is_some(), "no band for {tl}");
        }
        assert!(config.band_for_level(0).is_none());
        assert!(config.band_for_level(11).is_none());
    }

    #[test]
    fn overlapping_bands_rejected() {
        let mut config = BotConfig::default();
        config.bounties.divisions = vec![
            DivisionBand::new("a", 1, 5),
            DivisionBand::new("b", 5, 10),
        ];
        assert!(matches!(config.validate(), Err(BountyError::Config(_))));
    }

    #[test]
    fn gap_between_bands_rejected() {
        let mut config = BotConfig::default();
        config.bounties.divisions = vec![
            DivisionBand::new("a", 1, 3),
            DivisionBand::new("b", 5, 10),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn bands_must_reach_max_level() {
        let mut config = BotConfig::default();
        config.bounties.divisions = vec![DivisionBand::new("a", 1, 9)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_decay_rate_rejected() {
        let mut config = BotConfig::default();
        config.activity.guild_activity_decay_rate = 1.5;
        assert!(config.validate().is_err());
        config.activity.guild_activity_decay_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_housekeeping_interval_rejected() {
        let mut config = BotConfig::default();
        config.bounties.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.spawn.failure_retry_secs = 0;
        assert!(config.validate().is_err());

        let mut config = BotConfig::default();
        config.persistence.autosave_interval_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_random_delay_rejected() {
        let mut config = BotConfig::default();
        config.spawn.new_bounty_delay = NewBountyDelay::Random {
            min_secs: 10,
            max_secs: 5,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_preserves_delay_kind() {
        let mut config = BotConfig::default();
        config.spawn.new_bounty_delay = NewBountyDelay::FixedRouteScale {
            secs: 30,
            coefficient: 2.0,
            fallback_route_len: 4,
        };
        config.timed_tasks.checking_type = CheckingType::Fixed;

        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("fixed-route-scale"));
        let restored: BotConfig = toml::from_str(&text).unwrap();
        assert_eq!(restored.spawn.new_bounty_delay, config.spawn.new_bounty_delay);
        assert_eq!(restored.timed_tasks.checking_type, CheckingType::Fixed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let text = r#"
            [timed_tasks]
            checking_type = "fixed"
            lateness_threshold_secs = 3

            [[discord.guilds]]
            guild_id = 42
            announce_channel_id = 7
        "#;
        let config: BotConfig = toml::from_str(text).unwrap();
        assert_eq!(config.timed_tasks.lateness_threshold_secs, 3);
        assert_eq!(config.bounties.max_bounties_per_division, 5);
        assert_eq!(config.discord.announce_channel(42), Some(7));
        assert_eq!(config.discord.announce_channel(43), None);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = BotConfig::from_file(std::path::Path::new("/nonexistent/bountybot.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = BotConfig::default();
        config.save_to_file(&path).unwrap();
        let restored = BotConfig::from_file(&path).unwrap();
        assert_eq!(restored.bounties.divisions, config.bounties.divisions);
    }
}
