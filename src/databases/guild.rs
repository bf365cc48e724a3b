//! Per-guild bounty handle.
//!
//! [`GuildBounties`] serializes every mutation of one guild's [`BountyDb`]
//! behind an async mutex and runs the spawner and respawn callbacks the
//! divisions schedule. Callbacks lock the database, mutate it, release the
//! lock, and only then await the announcer, so a slow or failing Discord
//! call never holds up other commands or timers.

use crate::bounties::bounty::{Bounty, CheckResult, RewardShare, UserId};
use crate::bounties::generator::BountyContent;
use crate::channels::{Announcer, BountyWonNotice, NewBountyNotice};
use crate::config::BotConfig;
use crate::databases::bounty_db::BountyDb;
use crate::databases::division::DivisionTasks;
use crate::error::{BountyError, Result};
use crate::scheduler::{ExpiryFn, FireOutcome, TaskScheduler, expiry_fn};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Result of one hunting check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    /// Canonical name of the hunted criminal.
    pub criminal: String,
    pub result: CheckResult,
    /// Payouts, present when the check captured the bounty.
    pub rewards: Option<HashMap<UserId, RewardShare>>,
}

/// One guild's bounty board.
pub struct GuildBounties {
    guild_id: u64,
    db: Mutex<BountyDb>,
    /// Cleared by [`GuildBounties::shutdown`] while holding `db`.
    enabled: AtomicBool,
    scheduler: TaskScheduler,
    content: Arc<dyn BountyContent>,
    announcer: Arc<dyn Announcer>,
    announce_channel: Option<u64>,
    xp_per_credit: f64,
    check_heat: f64,
}

impl std::fmt::Debug for GuildBounties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildBounties")
            .field("guild_id", &self.guild_id)
            .field("announcer", &self.announcer.id())
            .field("announce_channel", &self.announce_channel)
            .finish_non_exhaustive()
    }
}

impl GuildBounties {
    /// Create the guild's divisions and start their spawners.
    pub fn new(
        guild_id: u64,
        config: &BotConfig,
        scheduler: TaskScheduler,
        content: Arc<dyn BountyContent>,
        announcer: Arc<dyn Announcer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let spawn_guild = weak.clone();
            let respawn_guild = weak.clone();
            let tasks = DivisionTasks::new(
                scheduler.clone(),
                move |division: &str| spawn_callback(guild_id, spawn_guild.clone(), division.to_owned()),
                move |division: &str, criminal: &str| {
                    respawn_callback(
                        guild_id,
                        respawn_guild.clone(),
                        division.to_owned(),
                        criminal.to_owned(),
                    )
                },
                Duration::from_secs(config.spawn.failure_retry_secs),
            );
            info!(guild_id, "bounties enabled");
            Self {
                guild_id,
                db: Mutex::new(BountyDb::new(config, |_| tasks.clone())),
                enabled: AtomicBool::new(true),
                scheduler,
                content,
                announcer,
                announce_channel: config.discord.announce_channel(guild_id),
                xp_per_credit: config.bounties.xp_per_credit,
                check_heat: config.activity.check_heat,
            }
        })
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    /// Exclusive access to the guild's database.
    pub async fn db(&self) -> MutexGuard<'_, BountyDb> {
        self.db.lock().await
    }

    /// `false` once [`shutdown`](Self::shutdown) has run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Lock the database, refusing once the guild is shut down.
    async fn live_db(&self) -> Result<MutexGuard<'_, BountyDb>> {
        let db = self.db.lock().await;
        if !self.is_enabled() {
            return Err(disabled(self.guild_id));
        }
        Ok(db)
    }

    /// Spawn a new bounty in `division` and announce it.
    pub async fn spawn_new_bounty(&self, division: &str) -> Result<Bounty> {
        let (bounty, notice) = {
            let mut db = self.live_db().await?;
            let mut rng = rand::thread_rng();
            let bounty = db.spawn_new_bounty(division, self.content.as_ref(), &mut rng)?;
            let div = db.division_for_name(division)?;
            let notice = NewBountyNotice::new(self.guild_id, div, &bounty, self.announce_channel, false);
            (bounty, notice)
        };
        self.announce_new(&notice).await;
        Ok(bounty)
    }

    /// Respawn the escaped bounty for `criminal` in `division` and announce it.
    pub async fn respawn_bounty(&self, division: &str, criminal: &str) -> Result<Bounty> {
        let (bounty, notice) = {
            let mut db = self.live_db().await?;
            let mut rng = rand::thread_rng();
            let bounty = db.respawn_bounty(division, criminal, self.content.as_ref(), &mut rng)?;
            let div = db.division_for_name(division)?;
            let notice = NewBountyNotice::new(self.guild_id, div, &bounty, self.announce_channel, true);
            (bounty, notice)
        };
        self.announce_new(&notice).await;
        Ok(bounty)
    }

    pub async fn escape_bounty(&self, criminal: &str) -> Result<()> {
        self.live_db().await?.escape_bounty(criminal)
    }

    /// Check `system` for the bounty on `criminal` on behalf of `user`.
    ///
    /// Every recorded check heats the division. A correct check captures
    /// the bounty: rewards are computed, the bounty is removed, and the win
    /// is announced.
    pub async fn check_system(
        &self,
        user: UserId,
        criminal: &str,
        system: &str,
    ) -> Result<CheckOutcome> {
        let (outcome, notice) = {
            let mut db = self.live_db().await?;
            let division_name = db.division_of_bounty(criminal)?.to_owned();
            let division = db.division_for_name_mut(&division_name)?;
            let bounty = division
                .get_bounty_mut(criminal, None)
                .ok_or_else(|| BountyError::NotFound(format!("bounty '{criminal}'")))?;

            let result = bounty.check(system, user);
            let name = bounty.name().to_owned();
            let rewards =
                (result == CheckResult::Correct).then(|| bounty.calc_rewards(self.xp_per_credit));

            if matches!(result, CheckResult::Wrong | CheckResult::Correct) {
                division.raise_temp(self.check_heat);
            }
            let notice = match &rewards {
                Some(rewards) => {
                    let captured = division.remove_bounty(&name)?;
                    info!(guild_id = self.guild_id, criminal = %name, user, "bounty captured");
                    Some(BountyWonNotice::new(
                        self.guild_id,
                        division,
                        &captured,
                        rewards,
                        self.announce_channel,
                    ))
                }
                None => None,
            };
            (
                CheckOutcome {
                    criminal: name,
                    result,
                    rewards,
                },
                notice,
            )
        };

        if let Some(notice) = notice {
            self.announce_won(&notice).await;
        }
        Ok(outcome)
    }

    /// Force every non-full division's spawner to fire now, concurrently.
    ///
    /// Returns how many spawners fired. Failures are logged per division.
    pub async fn reset_all_new_bounty_tts(&self) -> usize {
        let tasks = self.db.lock().await.new_bounty_tts();
        let outcomes = futures_util::future::join_all(
            tasks.iter().map(|task| self.scheduler.force_expire(task, true)),
        )
        .await;

        let mut fired = 0;
        for (task, outcome) in tasks.iter().zip(outcomes) {
            match outcome {
                FireOutcome::Skipped => {
                    debug!(guild_id = self.guild_id, task = task.label(), "spawner busy, not reset");
                }
                FireOutcome::Dropped => {
                    warn!(guild_id = self.guild_id, task = task.label(), "spawner reset failed");
                }
                _ => fired += 1,
            }
        }
        info!(guild_id = self.guild_id, fired, "new bounty cooldowns reset");
        fired
    }

    /// Clear every division. Returns how many bounties were removed.
    pub async fn clear_bounties(&self, include_escaped: bool) -> usize {
        self.db.lock().await.clear_all(include_escaped).len()
    }

    pub async fn decay_temperatures(&self) {
        self.db.lock().await.decay_all();
    }

    /// Escape every bounty whose end time has passed and pay its contributors.
    ///
    /// Returns how many bounties escaped.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> usize {
        let (count, notices) = {
            let mut db = self.db.lock().await;
            let escaped = db.escape_overdue(now);
            let mut notices = Vec::new();
            for (division, bounty) in &escaped {
                info!(guild_id = self.guild_id, division = %division, criminal = bounty.name(), "bounty ran out of time");
                let rewards = bounty.calc_rewards(self.xp_per_credit);
                if rewards.is_empty() {
                    continue;
                }
                if let Ok(div) = db.division_for_name(division) {
                    notices.push(BountyWonNotice::new(
                        self.guild_id,
                        div,
                        bounty,
                        &rewards,
                        self.announce_channel,
                    ));
                }
            }
            (escaped.len(), notices)
        };
        for notice in &notices {
            self.announce_won(notice).await;
        }
        count
    }

    pub async fn set_bounty_board_channel(&self, division: &str, channel: Option<u64>) -> Result<()> {
        self.db
            .lock()
            .await
            .division_for_name_mut(division)?
            .set_bounty_board_channel(channel);
        Ok(())
    }

    pub async fn set_alert_role(&self, division: &str, role: Option<u64>) -> Result<()> {
        self.db
            .lock()
            .await
            .division_for_name_mut(division)?
            .set_alert_role_id(role);
        Ok(())
    }

    /// Remove every bounty and cancel every task of the guild.
    ///
    /// Spawns, respawns, escapes and checks fail with
    /// [`BountyError::Disabled`] afterwards, including callbacks that were
    /// already waiting for the lock.
    pub async fn shutdown(&self) {
        let mut db = self.db.lock().await;
        self.enabled.store(false, Ordering::Release);
        db.clear_all(true);
        db.cancel_tasks();
        info!(guild_id = self.guild_id, "bounties disabled");
    }

    async fn announce_new(&self, notice: &NewBountyNotice) {
        if let Err(e) = self.announcer.announce_new_bounty(notice).await {
            warn!(
                guild_id = self.guild_id,
                announcer = self.announcer.id(),
                criminal = %notice.criminal,
                error = %e,
                "new bounty announcement failed"
            );
        }
    }

    async fn announce_won(&self, notice: &BountyWonNotice) {
        if let Err(e) = self.announcer.announce_bounty_won(notice).await {
            warn!(
                guild_id = self.guild_id,
                announcer = self.announcer.id(),
                criminal = %notice.criminal,
                error = %e,
                "bounty result announcement failed"
            );
        }
    }
}

fn disabled(guild_id: u64) -> BountyError {
    BountyError::Disabled(format!("bounties for guild {guild_id}"))
}

fn spawn_callback(guild_id: u64, guild: Weak<GuildBounties>, division: String) -> ExpiryFn {
    expiry_fn(move || {
        let guild = guild.clone();
        let division = division.clone();
        async move {
            let Some(guild) = guild.upgrade() else {
                return Err(disabled(guild_id));
            };
            guild.spawn_new_bounty(&division).await.map(|_| ())
        }
    })
}

fn respawn_callback(
    guild_id: u64,
    guild: Weak<GuildBounties>,
    division: String,
    criminal: String,
) -> ExpiryFn {
    expiry_fn(move || {
        let guild = guild.clone();
        let division = division.clone();
        let criminal = criminal.clone();
        async move {
            let Some(guild) = guild.upgrade() else {
                return Err(disabled(guild_id));
            };
            guild.respawn_bounty(&division, &criminal).await.map(|_| ())
        }
    })
}
