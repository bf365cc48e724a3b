//! Bounty state persistence.
//!
//! The whole bot state is a single JSON document: per guild, per division,
//! the activity temperature, board settings, the next spawn instant, and
//! every active and escaped bounty. Timed tasks are not serialized; they are
//! rebuilt from the stored instants on restore.

use crate::bounties::bounty::{Bounty, BountyRecord};
use crate::databases::bounty_db::BountyDb;
use crate::error::{BountyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Current on-disk format version.
pub const STATE_VERSION: u32 = 1;

/// Everything the bot persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Keyed by guild id.
    #[serde(default)]
    pub guilds: BTreeMap<u64, BountyDbState>,
}

/// One guild's bounty database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BountyDbState {
    #[serde(default)]
    pub divisions: Vec<DivisionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionState {
    pub name: String,
    pub temperature: f64,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub latest_route_len: Option<usize>,
    #[serde(default)]
    pub bounty_board_channel: Option<u64>,
    #[serde(default)]
    pub alert_role_id: Option<u64>,
    #[serde(default)]
    pub next_spawn_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bounties: Vec<BountyRecord>,
    /// Escaped bounties; each record carries its `respawn_at`.
    #[serde(default)]
    pub escaped: Vec<BountyRecord>,
}

impl BountyDb {
    /// Snapshot the database.
    pub fn to_state(&self) -> BountyDbState {
        BountyDbState {
            divisions: self
                .divisions()
                .iter()
                .map(|d| DivisionState {
                    name: d.name().to_owned(),
                    temperature: d.temperature(),
                    is_active: d.is_active(),
                    latest_route_len: d.latest_route_len(),
                    bounty_board_channel: d.bounty_board_channel(),
                    alert_role_id: d.alert_role_id(),
                    next_spawn_at: d.next_spawn_at(),
                    bounties: d.bounties().map(Bounty::to_record).collect(),
                    escaped: d.escaped_bounties().map(Bounty::to_record).collect(),
                })
                .collect(),
        }
    }

    /// Load a snapshot into this database.
    ///
    /// Division settings are matched by name; bounties go to the division
    /// covering their tech level, so a changed band layout still places
    /// them. Escaped bounties get fresh respawn tasks for their stored
    /// instants.
    ///
    /// # Errors
    ///
    /// Fails on the first record that is invalid, duplicated, or has a tech
    /// level no division covers. Records before it stay loaded.
    pub fn restore_state(&mut self, state: BountyDbState) -> Result<()> {
        let mut spawn_times = Vec::new();
        for division in &state.divisions {
            match self.division_for_name_mut(&division.name) {
                Ok(d) => {
                    d.set_temperature(division.temperature, division.is_active);
                    d.set_latest_route_len(division.latest_route_len);
                    d.set_bounty_board_channel(division.bounty_board_channel);
                    d.set_alert_role_id(division.alert_role_id);
                    if let Some(at) = division.next_spawn_at {
                        spawn_times.push((division.name.clone(), at));
                    }
                }
                Err(_) => warn!(division = %division.name, "stored division no longer configured"),
            }
        }

        for division in state.divisions {
            for record in division.bounties {
                let bounty = self.unique_bounty(record)?;
                self.division_for_level_mut(bounty.tech_level())?
                    .restore_bounty(bounty)?;
            }
            for mut record in division.escaped {
                let respawn_at = record.respawn_at.take();
                let bounty = self.unique_bounty(record)?;
                let name = bounty.name().to_owned();
                let target = self.division_for_level_mut(bounty.tech_level())?;
                match respawn_at {
                    Some(at) => target.restore_escaped(bounty, at)?,
                    None => {
                        target.restore_bounty(bounty)?;
                        target.escape_bounty(&name, None)?;
                    }
                }
            }
        }

        // Spawners only exist once the restored bounties are counted.
        for (name, at) in spawn_times {
            if let Ok(d) = self.division_for_name_mut(&name) {
                d.set_next_spawn_at(at);
            }
        }
        Ok(())
    }

    fn unique_bounty(&self, record: BountyRecord) -> Result<Bounty> {
        let bounty = Bounty::from_record(record)?;
        if self.has_criminal(bounty.name()) {
            return Err(BountyError::Duplicate(bounty.name().to_owned()));
        }
        Ok(bounty)
    }
}

/// Write `state` to `path` as pretty JSON, atomically.
pub fn save_state(path: &Path, state: &BotState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BountyError::Persistence(format!(
                "failed to create state directory '{}': {e}",
                parent.display()
            ))
        })?;
    }

    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| BountyError::Persistence(format!("failed to serialize state: {e}")))?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|e| {
        BountyError::Persistence(format!("failed to write '{}': {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        BountyError::Persistence(format!("failed to finalize '{}': {e}", path.display()))
    })?;
    info!(path = %path.display(), guilds = state.guilds.len(), "bounty state saved");
    Ok(())
}

/// Read the state at `path`. A missing file is an empty state.
pub fn load_state(path: &Path) -> Result<BotState> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no saved bounty state");
            return Ok(BotState::default());
        }
        Err(e) => {
            return Err(BountyError::Persistence(format!(
                "failed to read '{}': {e}",
                path.display()
            )));
        }
    };
    let state: BotState = serde_json::from_slice(&bytes).map_err(|e| {
        BountyError::Persistence(format!("malformed state file '{}': {e}", path.display()))
    })?;
    if state.version > STATE_VERSION {
        return Err(BountyError::Persistence(format!(
            "state file version {} is newer than supported version {STATE_VERSION}",
            state.version
        )));
    }
    Ok(state)
}
