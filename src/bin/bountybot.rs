//! CLI binary for bountybot.

use bountybot::persistence;
use bountybot::{AppContext, BotConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bounty lifecycle scheduler for the BountyBot Discord game.
#[derive(Parser)]
#[command(name = "bountybot", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the bounty scheduler until Ctrl+C.
    Run,

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Summarize the saved bounty state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bountybot=info,reqwest=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(BotConfig::default_config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(load_config(&config_path)?).await,
        Command::InitConfig { force } => init_config(&config_path, force),
        Command::Status => status(&load_config(&config_path)?),
    }
}

/// The file at `path`, or defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<BotConfig> {
    if path.exists() {
        info!(path = %path.display(), "loading config");
        Ok(BotConfig::from_file(path)?)
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        Ok(BotConfig::default())
    }
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    println!("bountybot v{}", env!("CARGO_PKG_VERSION"));

    let startup_guilds: Vec<u64> = config.discord.guilds.iter().map(|g| g.guild_id).collect();
    let ctx = AppContext::from_config(config);
    let restored = ctx.load_state().await?;
    for guild_id in startup_guilds {
        ctx.enable_bounties(guild_id);
    }
    ctx.start()?;
    println!(
        "Running for {} guild(s), {restored} restored from {}. Press Ctrl+C to stop.",
        ctx.guild_ids().len(),
        ctx.state_path().display()
    );

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down...");
    ctx.shutdown().await?;
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    BotConfig::default().save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn status(config: &BotConfig) -> anyhow::Result<()> {
    let path = config.persistence.resolved_state_path();
    let state = persistence::load_state(&path)?;
    match state.saved_at {
        Some(at) => println!("State file {} (saved {at})", path.display()),
        None => println!("State file {} (empty)", path.display()),
    }
    for (guild_id, db) in &state.guilds {
        println!("\nGuild {guild_id}:");
        for division in &db.divisions {
            println!(
                "  {:<10} temp {:>5.1}{}  active {:>2}  escaped {:>2}",
                division.name,
                division.temperature,
                if division.is_active { "*" } else { " " },
                division.bounties.len(),
                division.escaped.len(),
            );
        }
    }
    Ok(())
}
