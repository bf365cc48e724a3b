//! End-to-end bounty lifecycle through a running scheduler.
//!
//! Spawn delays and escape windows are configured to zero so timers fire
//! on the next scheduler pass.

use bountybot::bounties::{CheckResult, StaticContent};
use bountybot::channels::MemoryAnnouncer;
use bountybot::config::NewBountyDelay;
use bountybot::{AppContext, BotConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const GUILD: u64 = 1;

fn instant_config(dir: &Path) -> BotConfig {
    let mut config = BotConfig::default();
    config.spawn.new_bounty_delay = NewBountyDelay::Fixed { secs: 0 };
    config.persistence.state_path = Some(dir.join("state.json"));
    config.persistence.autosave_interval_secs = 0;
    config
}

fn make_ctx(config: BotConfig) -> (Arc<AppContext>, Arc<MemoryAnnouncer>) {
    let announcer = Arc::new(MemoryAnnouncer::new());
    let ctx = AppContext::new(config, Arc::new(StaticContent::new()), announcer.clone());
    (ctx, announcer)
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn capture_frees_room_for_the_next_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, announcer) = make_ctx(instant_config(dir.path()));
    ctx.enable_bounties(GUILD);
    ctx.start().unwrap();

    // Every division sits at the temperature floor: one bounty each.
    assert!(wait_until(|| announcer.new_bounties().len() == 3).await);

    let notice = announcer
        .new_bounties()
        .into_iter()
        .find(|n| n.division == "rookie")
        .unwrap();
    let answer = {
        let guild = ctx.guild(GUILD).unwrap();
        let db = guild.db().await;
        db.get_bounty(&notice.criminal, None).unwrap().answer().to_owned()
    };

    let outcome = ctx
        .check_system(GUILD, 42, &notice.criminal, &answer)
        .await
        .unwrap();
    assert_eq!(outcome.result, CheckResult::Correct);
    assert!(outcome.rewards.unwrap()[&42].won);

    assert!(wait_until(|| announcer.new_bounties().len() == 4).await);
    let won = announcer.bounties_won();
    assert_eq!(won.len(), 1);
    assert_eq!(won[0].winner, Some(42));

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn escaped_bounty_respawns_for_the_same_criminal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = instant_config(dir.path());
    config.bounties.escape_respawn_secs_per_system = 0;
    let (ctx, announcer) = make_ctx(config);
    ctx.enable_bounties(GUILD);
    ctx.start().unwrap();

    assert!(wait_until(|| announcer.new_bounties().len() == 3).await);
    let first = announcer.new_bounties().remove(0);

    ctx.escape_bounty(GUILD, &first.criminal).await.unwrap();
    assert!(
        wait_until(|| announcer
            .new_bounties()
            .iter()
            .any(|n| n.respawned && n.criminal == first.criminal))
        .await
    );

    let guild = ctx.guild(GUILD).unwrap();
    let db = guild.db().await;
    let bounty = db.get_bounty(&first.criminal, None).unwrap();
    assert!(!bounty.is_escaped());
    assert!(db.get_escaped_bounty(&first.criminal, None).is_err());
    drop(db);

    ctx.shutdown().await.unwrap();
}

#[tokio::test]
async fn overdue_bounties_escape_on_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = instant_config(dir.path());
    config.bounties.duration_per_system_secs = 0;
    let (ctx, announcer) = make_ctx(config);
    ctx.enable_bounties(GUILD);

    assert_eq!(ctx.reset_new_bounty_cooldowns(GUILD).await.unwrap(), 3);
    assert_eq!(ctx.sweep_overdue().await, 3);

    let guild = ctx.guild(GUILD).unwrap();
    let db = guild.db().await;
    for notice in announcer.new_bounties() {
        assert!(db.get_escaped_bounty(&notice.criminal, None).is_ok());
    }
    // Nobody checked anything, so nobody is paid.
    assert!(announcer.bounties_won().is_empty());
}

#[tokio::test]
async fn restart_restores_board_and_timers() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, announcer) = make_ctx(instant_config(dir.path()));
    ctx.enable_bounties(GUILD);
    ctx.reset_new_bounty_cooldowns(GUILD).await.unwrap();
    let spawned = announcer.new_bounties();
    ctx.escape_bounty(GUILD, &spawned[0].criminal).await.unwrap();
    ctx.save_state().await.unwrap();
    ctx.disable_bounties(GUILD).await.unwrap();

    let (restarted, _) = make_ctx(instant_config(dir.path()));
    assert_eq!(restarted.load_state().await.unwrap(), 1);
    let guild = restarted.guild(GUILD).unwrap();
    let db = guild.db().await;
    let escaped = db.get_escaped_bounty(&spawned[0].criminal, None).unwrap();
    let task = escaped.respawn_task().unwrap();
    assert!(restarted.scheduler().contains(task));
    for notice in &spawned[1..] {
        assert!(db.get_bounty(&notice.criminal, None).is_ok());
    }
}
