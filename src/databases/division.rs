//! Bounty divisions.
//!
//! A [`BountyDivision`] owns every bounty of one tech-level band in one
//! guild. Its capacity follows its activity temperature, and it keeps a
//! recurring new-bounty spawner scheduled exactly while it has room:
//! after every mutation [`BountyDivision::refresh_spawner`] restores
//! "spawner present iff `get_num_bounties(true) < max_bounties()`".
//!
//! Escaped bounties hold one-shot respawn tasks. Both kinds of task get
//! their callbacks from the division's [`DivisionTasks`], so the division
//! itself never refers back to the guild that owns it.

use crate::bounties::bounty::Bounty;
use crate::bounties::generator::BountyConfig;
use crate::config::{BotConfig, DivisionBand};
use crate::databases::spawn_delay::{SharedCadence, SpawnCadence, cadence_generator};
use crate::error::{BountyError, Result};
use crate::scheduler::task::instant_after;
use crate::scheduler::{ExpiryFn, TaskScheduler, TimedTask};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

type SpawnFactory = Arc<dyn Fn(&str) -> ExpiryFn + Send + Sync>;
type RespawnFactory = Arc<dyn Fn(&str, &str) -> ExpiryFn + Send + Sync>;

/// Scheduler handle and callback factories for a division's timed tasks.
#[derive(Clone)]
pub struct DivisionTasks {
    scheduler: TaskScheduler,
    on_spawn: Option<SpawnFactory>,
    on_respawn: Option<RespawnFactory>,
    failure_retry: Duration,
}

impl std::fmt::Debug for DivisionTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DivisionTasks")
            .field("scheduler", &self.scheduler)
            .field("failure_retry", &self.failure_retry)
            .finish_non_exhaustive()
    }
}

impl DivisionTasks {
    /// `on_spawn(division)` builds the spawner callback; `on_respawn(division,
    /// criminal)` builds the callback of an escaped bounty's respawn task.
    pub fn new<S, R>(
        scheduler: TaskScheduler,
        on_spawn: S,
        on_respawn: R,
        failure_retry: Duration,
    ) -> Self
    where
        S: Fn(&str) -> ExpiryFn + Send + Sync + 'static,
        R: Fn(&str, &str) -> ExpiryFn + Send + Sync + 'static,
    {
        Self {
            scheduler,
            on_spawn: Some(Arc::new(on_spawn)),
            on_respawn: Some(Arc::new(on_respawn)),
            failure_retry,
        }
    }

    /// Tasks are scheduled but carry no callbacks.
    pub fn inert(scheduler: TaskScheduler) -> Self {
        Self {
            scheduler,
            on_spawn: None,
            on_respawn: None,
            failure_retry: Duration::from_secs(60),
        }
    }

    /// Scheduler every task of the division is registered with.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }
}

type Levels = BTreeMap<u8, HashMap<String, Bounty>>;

/// All bounties of one tech-level band within one guild.
#[derive(Debug)]
pub struct BountyDivision {
    band: DivisionBand,
    capacity: usize,
    min_activity: f64,
    decay_rate: f64,
    escape_secs_per_system: u64,
    temperature: f64,
    is_active: bool,
    bounties: Levels,
    escaped: Levels,
    cadence: SharedCadence,
    new_bounty_tt: Option<Arc<TimedTask>>,
    bounty_board_channel: Option<u64>,
    alert_role_id: Option<u64>,
    tasks: DivisionTasks,
}

impl BountyDivision {
    /// Create an empty division at the temperature floor and start its spawner.
    pub fn new(band: &DivisionBand, config: &BotConfig, tasks: DivisionTasks) -> Self {
        let floor = config.activity.min_guild_activity;
        let mut division = Self {
            band: band.clone(),
            capacity: config.bounties.max_bounties_per_division,
            min_activity: floor,
            decay_rate: config.activity.guild_activity_decay_rate,
            escape_secs_per_system: config.bounties.escape_respawn_secs_per_system,
            temperature: floor,
            is_active: false,
            bounties: empty_levels(band),
            escaped: empty_levels(band),
            cadence: SpawnCadence::new(config.spawn.new_bounty_delay.clone(), floor).shared(),
            new_bounty_tt: None,
            bounty_board_channel: None,
            alert_role_id: None,
            tasks,
        };
        division.refresh_spawner();
        division
    }

    /// Division name, unique within the guild.
    pub fn name(&self) -> &str {
        &self.band.name
    }

    /// The tech-level band this division serves.
    pub fn band(&self) -> &DivisionBand {
        &self.band
    }

    pub fn min_level(&self) -> u8 {
        self.band.min_level
    }

    pub fn max_level(&self) -> u8 {
        self.band.max_level
    }

    /// Returns `true` if bounties of `tech_level` belong here.
    pub fn covers_level(&self, tech_level: u8) -> bool {
        self.band.contains(tech_level)
    }

    /// Current guild activity in this division, never below the floor.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// `false` once decay has brought the temperature down to the floor.
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Capacity at the current temperature: `min(cap, max(1, floor(temperature)))`.
    pub fn max_bounties(&self) -> usize {
        let by_temperature = if self.temperature >= 1.0 {
            self.temperature.floor() as usize
        } else {
            1
        };
        self.capacity.min(by_temperature.max(1))
    }

    /// Number of active bounties, plus escaped ones when `include_escaped`.
    pub fn get_num_bounties(&self, include_escaped: bool) -> usize {
        let active: usize = self.bounties.values().map(HashMap::len).sum();
        if include_escaped {
            active + self.escaped.values().map(HashMap::len).sum::<usize>()
        } else {
            active
        }
    }

    /// Returns `true` when active and escaped bounties fill the capacity.
    pub fn is_full(&self) -> bool {
        self.get_num_bounties(true) >= self.max_bounties()
    }

    /// Returns `true` when the division holds no active and no escaped bounties.
    pub fn is_empty(&self) -> bool {
        self.get_num_bounties(true) == 0
    }

    /// Pick a tech level for a new bounty: the lowest level with no active
    /// bounty, else a uniformly random level of the band.
    ///
    /// # Errors
    ///
    /// [`BountyError::Capacity`] if the division is full.
    pub fn pick_new_tl<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<u8> {
        if self.is_full() {
            return Err(BountyError::Capacity(format!("division {} is full", self.band.name)));
        }
        let empty = (self.band.min_level..=self.band.max_level)
            .find(|tl| self.bounties.get(tl).is_none_or(HashMap::is_empty));
        Ok(empty.unwrap_or_else(|| rng.gen_range(self.band.min_level..=self.band.max_level)))
    }

    /// Active or escaped bounty for this exact criminal name.
    pub fn contains_criminal(&self, name: &str) -> bool {
        self.bounties.values().any(|m| m.contains_key(name))
            || self.escaped.values().any(|m| m.contains_key(name))
    }

    /// Active bounty by criminal name or alias, optionally at one level.
    pub fn get_bounty(&self, name: &str, level: Option<u8>) -> Option<&Bounty> {
        find_in(&self.bounties, name, level)
    }

    /// Mutable form of [`get_bounty`](Self::get_bounty).
    pub fn get_bounty_mut(&mut self, name: &str, level: Option<u8>) -> Option<&mut Bounty> {
        let canonical = find_in(&self.bounties, name, level)?.name().to_owned();
        self.bounties
            .values_mut()
            .find_map(|m| m.get_mut(&canonical))
    }

    /// Escaped bounty by criminal name or alias, optionally at one level.
    pub fn get_escaped_bounty(&self, name: &str, level: Option<u8>) -> Option<&Bounty> {
        find_in(&self.escaped, name, level)
    }

    /// Active bounties in ascending tech-level order.
    pub fn bounties(&self) -> impl Iterator<Item = &Bounty> {
        self.bounties.values().flat_map(HashMap::values)
    }

    /// Escaped bounties in ascending tech-level order.
    pub fn escaped_bounties(&self) -> impl Iterator<Item = &Bounty> {
        self.escaped.values().flat_map(HashMap::values)
    }

    /// Insert a new active bounty.
    ///
    /// # Errors
    ///
    /// - [`BountyError::InvalidBounty`] if its tech level is outside the band.
    /// - [`BountyError::Capacity`] if the division is full.
    /// - [`BountyError::Duplicate`] if the criminal is already in the division.
    pub fn add_bounty(&mut self, bounty: Bounty) -> Result<()> {
        let tl = bounty.tech_level();
        if !self.covers_level(tl) {
            return Err(BountyError::InvalidBounty(format!(
                "tech level {tl} is outside division {}",
                self.band.name
            )));
        }
        if self.is_full() {
            return Err(BountyError::Capacity(format!("division {} is full", self.band.name)));
        }
        if self.contains_criminal(bounty.name()) {
            return Err(BountyError::Duplicate(bounty.name().to_owned()));
        }

        self.note_route_len(bounty.route().len());
        debug!(division = %self.band.name, criminal = bounty.name(), tech_level = tl, "bounty added");
        self.bounties
            .entry(tl)
            .or_default()
            .insert(bounty.name().to_owned(), bounty);
        self.refresh_spawner();
        Ok(())
    }

    /// Remove an active bounty by name or alias.
    pub fn remove_bounty(&mut self, name: &str) -> Result<Bounty> {
        let bounty = take_from(&mut self.bounties, name)
            .ok_or_else(|| BountyError::NotFound(format!("bounty '{name}'")))?;
        debug!(division = %self.band.name, criminal = bounty.name(), "bounty removed");
        self.refresh_spawner();
        Ok(bounty)
    }

    /// Move an active bounty into the escaped state.
    ///
    /// The respawn task fires at `respawn_at`, or after the bounty's escape
    /// window when `None`.
    ///
    /// # Errors
    ///
    /// - [`BountyError::AlreadyEscaped`] if the bounty is already escaped.
    /// - [`BountyError::NotFound`] if there is no such bounty.
    pub fn escape_bounty(&mut self, name: &str, respawn_at: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(escaped) = self.get_escaped_bounty(name, None) {
            return Err(BountyError::AlreadyEscaped(escaped.name().to_owned()));
        }
        let mut bounty = take_from(&mut self.bounties, name)
            .ok_or_else(|| BountyError::NotFound(format!("bounty '{name}'")))?;

        let task = match self.respawn_task(&bounty, respawn_at) {
            Ok(task) => task,
            Err(e) => {
                self.put_back(bounty);
                return Err(e);
            }
        };
        if let Err(e) = bounty.escape(Arc::clone(&task)) {
            self.put_back(bounty);
            return Err(e);
        }

        info!(
            division = %self.band.name,
            criminal = bounty.name(),
            respawn_at = %task.expiry_time(),
            "bounty escaped"
        );
        self.tasks.scheduler.schedule(task);
        self.escaped
            .entry(bounty.tech_level())
            .or_default()
            .insert(bounty.name().to_owned(), bounty);
        self.refresh_spawner();
        Ok(())
    }

    fn put_back(&mut self, bounty: Bounty) {
        self.bounties
            .entry(bounty.tech_level())
            .or_default()
            .insert(bounty.name().to_owned(), bounty);
    }

    fn respawn_task(
        &self,
        bounty: &Bounty,
        respawn_at: Option<DateTime<Utc>>,
    ) -> Result<Arc<TimedTask>> {
        let mut builder = TimedTask::builder(format!("respawn {}: {}", self.band.name, bounty.name()))
            .reschedule_on_failure(true)
            .failure_delay(self.tasks.failure_retry);
        builder = match respawn_at {
            Some(at) => builder.expires_at(at),
            None => builder
                .expires_in(bounty.respawn_delay(Duration::from_secs(self.escape_secs_per_system))),
        };
        if let Some(factory) = &self.tasks.on_respawn {
            builder = builder.callback(factory(&self.band.name, bounty.name()));
        }
        builder.build()
    }

    /// Regenerate an escaped bounty from `config` and make it active again.
    ///
    /// # Errors
    ///
    /// - [`BountyError::NotFound`] if no such bounty is escaped.
    /// - [`BountyError::Capacity`] if active bounties already fill the capacity.
    /// - any error of [`Bounty::regenerate`]; the bounty then stays escaped.
    pub fn respawn_bounty(&mut self, name: &str, config: BountyConfig) -> Result<&Bounty> {
        if self.get_escaped_bounty(name, None).is_none() {
            return Err(BountyError::NotFound(format!("escaped bounty '{name}'")));
        }
        if self.get_num_bounties(false) >= self.max_bounties() {
            return Err(BountyError::Capacity(format!(
                "division {} has no room to respawn {name}",
                self.band.name
            )));
        }

        let Some(mut bounty) = take_from(&mut self.escaped, name) else {
            return Err(BountyError::NotFound(format!("escaped bounty '{name}'")));
        };
        // On failure the bounty is unchanged and keeps its respawn task.
        if let Err(e) = bounty.regenerate(config) {
            self.escaped
                .entry(bounty.tech_level())
                .or_default()
                .insert(bounty.name().to_owned(), bounty);
            return Err(e);
        }
        if let Some(task) = bounty.take_respawn_task() {
            self.tasks.scheduler.unschedule(&task);
        }

        info!(division = %self.band.name, criminal = bounty.name(), "bounty respawned");
        self.note_route_len(bounty.route().len());
        let tl = bounty.tech_level();
        let key = bounty.name().to_owned();
        self.bounties.entry(tl).or_default().insert(key.clone(), bounty);
        self.refresh_spawner();
        self.bounties
            .get(&tl)
            .and_then(|m| m.get(&key))
            .ok_or_else(|| BountyError::NotFound(format!("bounty '{key}'")))
    }

    /// Re-insert a persisted active bounty.
    ///
    /// Capacity is not enforced: a division restored above its current
    /// maximum simply stays full until bounties leave it.
    pub fn restore_bounty(&mut self, bounty: Bounty) -> Result<()> {
        if !self.covers_level(bounty.tech_level()) {
            return Err(BountyError::InvalidBounty(format!(
                "tech level {} is outside division {}",
                bounty.tech_level(),
                self.band.name
            )));
        }
        if self.contains_criminal(bounty.name()) {
            return Err(BountyError::Duplicate(bounty.name().to_owned()));
        }
        self.put_back(bounty);
        self.refresh_spawner();
        Ok(())
    }

    /// Re-insert a persisted escaped bounty, respawning at `respawn_at`.
    pub fn restore_escaped(&mut self, bounty: Bounty, respawn_at: DateTime<Utc>) -> Result<()> {
        if !self.covers_level(bounty.tech_level()) {
            return Err(BountyError::InvalidBounty(format!(
                "tech level {} is outside division {}",
                bounty.tech_level(),
                self.band.name
            )));
        }
        if self.contains_criminal(bounty.name()) {
            return Err(BountyError::Duplicate(bounty.name().to_owned()));
        }
        let name = bounty.name().to_owned();
        self.put_back(bounty);
        self.escape_bounty(&name, Some(respawn_at))
    }

    /// Multiply the temperature by the decay rate, never dropping below the floor.
    pub fn decay_temp(&mut self) {
        let decayed = (self.temperature * self.decay_rate * 10.0).round() / 10.0;
        self.temperature = decayed.max(self.min_activity);
        self.is_active = self.temperature > self.min_activity;
        self.sync_temperature();
    }

    /// Add `amount` to the temperature and mark the division active.
    pub fn raise_temp(&mut self, amount: f64) {
        self.temperature += amount;
        self.is_active = true;
        self.sync_temperature();
    }

    /// Restore a persisted temperature.
    pub fn set_temperature(&mut self, temperature: f64, is_active: bool) {
        self.temperature = temperature.max(self.min_activity);
        self.is_active = is_active;
        self.sync_temperature();
    }

    fn sync_temperature(&mut self) {
        self.cadence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .temperature = self.temperature;
        self.refresh_spawner();
    }

    fn note_route_len(&self, len: usize) {
        self.cadence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest_route_len = Some(len);
    }

    /// Route length of the latest bounty added or respawned.
    pub fn latest_route_len(&self) -> Option<usize> {
        self.cadence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest_route_len
    }

    /// Route length the next spawn delay scales by. Used when restoring state.
    pub fn set_latest_route_len(&mut self, len: Option<usize>) {
        self.cadence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .latest_route_len = len;
    }

    /// Remove every active bounty and, with `include_escaped`, every escaped
    /// bounty together with its respawn task. Returns the removed bounties.
    pub fn clear(&mut self, include_escaped: bool) -> Vec<Bounty> {
        let mut removed: Vec<Bounty> = std::mem::take(&mut self.bounties)
            .into_values()
            .flat_map(HashMap::into_values)
            .collect();
        if include_escaped {
            for mut bounty in std::mem::take(&mut self.escaped)
                .into_values()
                .flat_map(HashMap::into_values)
            {
                if let Some(task) = bounty.take_respawn_task() {
                    self.tasks.scheduler.unschedule(&task);
                }
                removed.push(bounty);
            }
        }
        info!(division = %self.band.name, removed = removed.len(), include_escaped, "division cleared");
        self.refresh_spawner();
        removed
    }

    /// Active bounties whose end time has passed at `now`.
    pub fn overdue_bounties(&self, now: DateTime<Utc>) -> Vec<String> {
        self.bounties()
            .filter(|b| b.is_overdue(now))
            .map(|b| b.name().to_owned())
            .collect()
    }

    /// Move every overdue active bounty into the escaped state.
    ///
    /// Returns copies of the escaped bounties, taken before escaping, so
    /// callers can settle their contributors.
    pub fn escape_overdue(&mut self, now: DateTime<Utc>) -> Vec<Bounty> {
        let mut escaped = Vec::new();
        for name in self.overdue_bounties(now) {
            let Some(snapshot) = self.get_bounty(&name, None).cloned() else {
                continue;
            };
            match self.escape_bounty(&name, None) {
                Ok(()) => escaped.push(snapshot),
                Err(e) => error!(division = %self.band.name, criminal = %name, error = %e, "overdue bounty could not escape"),
            }
        }
        escaped
    }

    /// Spawner task, present exactly while the division has room.
    pub fn new_bounty_tt(&self) -> Option<&Arc<TimedTask>> {
        self.new_bounty_tt.as_ref()
    }

    /// Next scheduled spawn attempt.
    pub fn next_spawn_at(&self) -> Option<DateTime<Utc>> {
        self.new_bounty_tt.as_ref().map(|t| t.expiry_time())
    }

    /// Reschedule the spawner's next attempt for `at`, if a spawner is running.
    pub fn set_next_spawn_at(&mut self, at: DateTime<Utc>) {
        if let Some(task) = self.new_bounty_tt.take() {
            self.tasks.scheduler.unschedule(&task);
            self.start_spawner(Some(at));
        }
    }

    /// Start or stop the spawner so it runs exactly while the division has room.
    pub fn refresh_spawner(&mut self) {
        let has_room = self.get_num_bounties(true) < self.max_bounties();
        match self.new_bounty_tt.clone() {
            Some(task) if !has_room => {
                self.tasks.scheduler.unschedule(&task);
                self.new_bounty_tt = None;
                debug!(division = %self.band.name, "division full, spawner stopped");
            }
            Some(task) if task.is_gravestoned() => {
                // Dropped by the scheduler after a fatal callback failure.
                error!(division = %self.band.name, task = task.label(), "spawner was dropped, restarting");
                self.new_bounty_tt = None;
                self.start_spawner(None);
            }
            None if has_room => self.start_spawner(None),
            _ => {}
        }
    }

    fn start_spawner(&mut self, at: Option<DateTime<Utc>>) {
        let first_delay = {
            let cadence = self.cadence.lock().unwrap_or_else(|e| e.into_inner());
            cadence.next_delay().unwrap_or(self.tasks.failure_retry)
        };
        let mut builder = TimedTask::builder(format!("new bounty: {}", self.band.name))
            .delay_generator(cadence_generator(&self.cadence))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .failure_delay(self.tasks.failure_retry);
        builder = match at {
            Some(at) => builder.expires_at(at),
            None => match instant_after(Utc::now(), first_delay) {
                Ok(at) => builder.expires_at(at),
                Err(_) => builder.expires_in(self.tasks.failure_retry),
            },
        };
        if let Some(factory) = &self.tasks.on_spawn {
            builder = builder.callback(factory(&self.band.name));
        }

        match builder.build() {
            Ok(task) => {
                debug!(division = %self.band.name, next_spawn = %task.expiry_time(), "spawner started");
                self.tasks.scheduler.schedule(Arc::clone(&task));
                self.new_bounty_tt = Some(task);
            }
            Err(e) => error!(division = %self.band.name, error = %e, "could not build spawner"),
        }
    }

    /// Cancel the spawner and every respawn task. Used when the division is discarded.
    pub fn cancel_tasks(&mut self) {
        if let Some(task) = self.new_bounty_tt.take() {
            self.tasks.scheduler.unschedule(&task);
        }
        for bounty in self.escaped.values().flat_map(HashMap::values) {
            if let Some(task) = bounty.respawn_task() {
                self.tasks.scheduler.unschedule(task);
            }
        }
    }

    /// Channel announcements for this division go to, overriding the guild's.
    pub fn bounty_board_channel(&self) -> Option<u64> {
        self.bounty_board_channel
    }

    pub fn set_bounty_board_channel(&mut self, channel: Option<u64>) {
        self.bounty_board_channel = channel;
    }

    /// Role mentioned when a bounty spawns here.
    pub fn alert_role_id(&self) -> Option<u64> {
        self.alert_role_id
    }

    pub fn set_alert_role_id(&mut self, role: Option<u64>) {
        self.alert_role_id = role;
    }
}

fn empty_levels(band: &DivisionBand) -> Levels {
    (band.min_level..=band.max_level)
        .map(|tl| (tl, HashMap::new()))
        .collect()
}

fn find_in<'a>(levels: &'a Levels, name: &str, level: Option<u8>) -> Option<&'a Bounty> {
    let mut maps: Box<dyn Iterator<Item = &'a HashMap<String, Bounty>> + 'a> = match level {
        Some(tl) => Box::new(levels.get(&tl).into_iter()),
        None => Box::new(levels.values()),
    };
    maps.find_map(|m| {
        m.get(name)
            .or_else(|| m.values().find(|b| b.criminal().is_called(name)))
    })
}

fn take_from(levels: &mut Levels, name: &str) -> Option<Bounty> {
    let canonical = find_in(levels, name, None)?.name().to_owned();
    levels.values_mut().find_map(|m| m.remove(&canonical))
}
