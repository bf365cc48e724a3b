//! Process-wide bounty context.
//!
//! [`AppContext`] owns the shared [`TaskScheduler`], every guild's
//! [`GuildBounties`], and the housekeeping jobs that keep them moving:
//! activity decay, the overdue sweep, and autosave. Chat commands enter
//! the core through its methods.

use crate::bounties::bounty::UserId;
use crate::bounties::content::StaticContent;
use crate::bounties::generator::BountyContent;
use crate::channels::{Announcer, announcer_from_config};
use crate::config::BotConfig;
use crate::databases::guild::{CheckOutcome, GuildBounties};
use crate::error::{BountyError, Result};
use crate::persistence::{self, BotState, STATE_VERSION};
use crate::scheduler::{TaskScheduler, TimedTask, expiry_fn};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared state of a running bot.
pub struct AppContext {
    config: BotConfig,
    scheduler: TaskScheduler,
    content: Arc<dyn BountyContent>,
    announcer: Arc<dyn Announcer>,
    guilds: Mutex<HashMap<u64, Arc<GuildBounties>>>,
    state_path: PathBuf,
    cancel: CancellationToken,
    housekeeping: Mutex<Vec<Arc<TimedTask>>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("scheduler", &self.scheduler)
            .field("announcer", &self.announcer.id())
            .field("state_path", &self.state_path)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn new(
        config: BotConfig,
        content: Arc<dyn BountyContent>,
        announcer: Arc<dyn Announcer>,
    ) -> Arc<Self> {
        let scheduler = TaskScheduler::from_config(&config.timed_tasks);
        let state_path = config.persistence.resolved_state_path();
        Arc::new(Self {
            config,
            scheduler,
            content,
            announcer,
            guilds: Mutex::new(HashMap::new()),
            state_path,
            cancel: CancellationToken::new(),
            housekeeping: Mutex::new(Vec::new()),
            runner: Mutex::new(None),
        })
    }

    /// Built-in game content, announcing through Discord when a token is set.
    pub fn from_config(config: BotConfig) -> Arc<Self> {
        let announcer = announcer_from_config(&config.discord);
        Self::new(config, Arc::new(StaticContent::new()), announcer)
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Enable bounties for `guild_id`. Enabling twice returns the existing board.
    pub fn enable_bounties(&self, guild_id: u64) -> Arc<GuildBounties> {
        let mut guilds = self.lock_guilds();
        Arc::clone(guilds.entry(guild_id).or_insert_with(|| {
            GuildBounties::new(
                guild_id,
                &self.config,
                self.scheduler.clone(),
                Arc::clone(&self.content),
                Arc::clone(&self.announcer),
            )
        }))
    }

    /// Disable bounties for `guild_id`, discarding its bounties and tasks.
    pub async fn disable_bounties(&self, guild_id: u64) -> Result<()> {
        let guild = self
            .lock_guilds()
            .remove(&guild_id)
            .ok_or_else(|| not_enabled(guild_id))?;
        guild.shutdown().await;
        Ok(())
    }

    pub fn guild(&self, guild_id: u64) -> Result<Arc<GuildBounties>> {
        self.lock_guilds()
            .get(&guild_id)
            .cloned()
            .ok_or_else(|| not_enabled(guild_id))
    }

    pub fn guild_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock_guilds().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn all_guilds(&self) -> Vec<Arc<GuildBounties>> {
        self.lock_guilds().values().cloned().collect()
    }

    fn lock_guilds(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<GuildBounties>>> {
        self.guilds.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn check_system(
        &self,
        guild_id: u64,
        user: UserId,
        criminal: &str,
        system: &str,
    ) -> Result<CheckOutcome> {
        self.guild(guild_id)?.check_system(user, criminal, system).await
    }

    pub async fn escape_bounty(&self, guild_id: u64, criminal: &str) -> Result<()> {
        self.guild(guild_id)?.escape_bounty(criminal).await
    }

    /// Make every open division of the guild spawn immediately.
    pub async fn reset_new_bounty_cooldowns(&self, guild_id: u64) -> Result<usize> {
        Ok(self.guild(guild_id)?.reset_all_new_bounty_tts().await)
    }

    pub async fn clear_bounties(&self, guild_id: u64, include_escaped: bool) -> Result<usize> {
        Ok(self.guild(guild_id)?.clear_bounties(include_escaped).await)
    }

    pub async fn set_bounty_board_channel(
        &self,
        guild_id: u64,
        division: &str,
        channel: Option<u64>,
    ) -> Result<()> {
        self.guild(guild_id)?
            .set_bounty_board_channel(division, channel)
            .await
    }

    pub async fn set_alert_role(
        &self,
        guild_id: u64,
        division: &str,
        role: Option<u64>,
    ) -> Result<()> {
        self.guild(guild_id)?.set_alert_role(division, role).await
    }

    /// Decay the activity temperature of every division in every guild.
    pub async fn decay_all_guilds(&self) {
        for guild in self.all_guilds() {
            guild.decay_temperatures().await;
        }
        debug!("guild activity decayed");
    }

    /// Escape every overdue bounty. Returns how many escaped.
    pub async fn sweep_overdue(&self) -> usize {
        let now = Utc::now();
        let mut escaped = 0;
        for guild in self.all_guilds() {
            escaped += guild.sweep_overdue(now).await;
        }
        escaped
    }

    /// Write every guild's state to the state file.
    pub async fn save_state(&self) -> Result<()> {
        let mut guilds = BTreeMap::new();
        for guild in self.all_guilds() {
            let state = guild.db().await.to_state();
            guilds.insert(guild.guild_id(), state);
        }
        let state = BotState {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            guilds,
        };
        persistence::save_state(&self.state_path, &state)
    }

    /// Restore guilds from the state file, enabling each stored guild.
    ///
    /// A guild whose records fail to restore keeps what loaded before the
    /// failure. Returns how many guilds were restored.
    pub async fn load_state(&self) -> Result<usize> {
        let state = persistence::load_state(&self.state_path)?;
        let count = state.guilds.len();
        for (guild_id, db_state) in state.guilds {
            let guild = self.enable_bounties(guild_id);
            if let Err(e) = guild.db().await.restore_state(db_state) {
                warn!(guild_id, error = %e, "bounty state partially restored");
            }
        }
        info!(guilds = count, path = %self.state_path.display(), "bounty state loaded");
        Ok(count)
    }

    /// Schedule housekeeping and start the scheduler loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut runner = self.runner.lock().unwrap_or_else(|e| e.into_inner());
        if runner.is_some() {
            return Ok(());
        }

        self.register_job(
            "guild activity decay",
            self.config.activity.decay_interval_secs,
            |ctx| async move {
                ctx.decay_all_guilds().await;
                Ok(())
            },
        )?;
        self.register_job(
            "overdue bounty sweep",
            self.config.bounties.sweep_interval_secs,
            |ctx| async move {
                ctx.sweep_overdue().await;
                Ok(())
            },
        )?;
        self.register_job(
            "autosave",
            self.config.persistence.autosave_interval_secs,
            |ctx| async move { ctx.save_state().await },
        )?;

        *runner = Some(self.scheduler.clone().run(self.cancel.clone()));
        info!(guilds = self.lock_guilds().len(), "bounty scheduler running");
        Ok(())
    }

    /// Stop the scheduler loop, drop housekeeping jobs, and save state.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runner) = runner
            && let Err(e) = runner.await
        {
            error!(error = %e, "scheduler loop ended abnormally");
        }
        for task in self
            .housekeeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            self.scheduler.unschedule(&task);
        }
        self.save_state().await
    }

    /// Schedule `job` to run every `every_secs` seconds. Zero disables it.
    fn register_job<F, Fut>(self: &Arc<Self>, label: &str, every_secs: u64, job: F) -> Result<()>
    where
        F: Fn(Arc<AppContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if every_secs == 0 {
            debug!(job = label, "housekeeping job disabled");
            return Ok(());
        }
        let ctx = Arc::downgrade(self);
        let job = Arc::new(job);
        let task = TimedTask::builder(label)
            .expires_in(Duration::from_secs(every_secs))
            .auto_reschedule(true)
            .reschedule_on_failure(true)
            .callback(expiry_fn(move || {
                let ctx = ctx.clone();
                let job = Arc::clone(&job);
                async move {
                    match ctx.upgrade() {
                        Some(ctx) => (*job)(ctx).await,
                        None => Err(BountyError::Disabled("bot".to_owned())),
                    }
                }
            }))
            .build()?;
        self.scheduler.schedule(Arc::clone(&task));
        self.housekeeping
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
        Ok(())
    }
}

fn not_enabled(guild_id: u64) -> BountyError {
    BountyError::NotFound(format!("bounties for guild {guild_id}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::channels::MemoryAnnouncer;

    fn make_ctx(dir: &Path) -> (Arc<AppContext>, Arc<MemoryAnnouncer>) {
        let mut config = BotConfig::default();
        config.persistence.state_path = Some(dir.join("state.json"));
        let announcer = Arc::new(MemoryAnnouncer::new());
        let ctx = AppContext::new(config, Arc::new(StaticContent::new()), announcer.clone());
        (ctx, announcer)
    }

    #[tokio::test]
    async fn enable_is_idempotent_and_disable_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = make_ctx(dir.path());

        let first = ctx.enable_bounties(7);
        let second = ctx.enable_bounties(7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.guild_ids(), vec![7]);
        assert_eq!(ctx.scheduler().len(), 3);

        ctx.disable_bounties(7).await.unwrap();
        assert!(ctx.scheduler().is_empty());
        assert!(matches!(ctx.guild(7), Err(BountyError::NotFound(_))));
        assert!(ctx.disable_bounties(7).await.is_err());
    }

    #[tokio::test]
    async fn commands_need_an_enabled_guild() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = make_ctx(dir.path());
        assert!(ctx.check_system(1, 2, "Ganfor", "Keren").await.is_err());
        assert!(ctx.reset_new_bounty_cooldowns(1).await.is_err());
        assert!(ctx.clear_bounties(1, true).await.is_err());
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = make_ctx(dir.path());
        let guild = ctx.enable_bounties(7);
        let bounty = guild.spawn_new_bounty("veteran").await.unwrap();
        ctx.set_alert_role(7, "veteran", Some(99)).await.unwrap();
        ctx.save_state().await.unwrap();

        let (restarted, _) = make_ctx(dir.path());
        assert_eq!(restarted.load_state().await.unwrap(), 1);
        let guild = restarted.guild(7).unwrap();
        let db = guild.db().await;
        let restored = db.get_bounty(bounty.name(), None).unwrap();
        assert_eq!(restored.route(), bounty.route());
        assert_eq!(restored.answer(), bounty.answer());
        assert_eq!(db.division_for_name("veteran").unwrap().alert_role_id(), Some(99));
    }

    #[tokio::test]
    async fn start_schedules_housekeeping_and_shutdown_saves() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = make_ctx(dir.path());
        ctx.start().unwrap();
        ctx.start().unwrap();
        assert_eq!(ctx.scheduler().len(), 3);

        ctx.shutdown().await.unwrap();
        assert!(ctx.scheduler().is_empty());
        assert!(ctx.state_path().exists());
    }

    #[tokio::test]
    async fn reset_spawns_through_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, announcer) = make_ctx(dir.path());
        ctx.enable_bounties(3);
        assert_eq!(ctx.reset_new_bounty_cooldowns(3).await.unwrap(), 3);
        assert_eq!(announcer.new_bounties().len(), 3);
        assert_eq!(ctx.clear_bounties(3, true).await.unwrap(), 3);
    }
}
