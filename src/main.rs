//! Hangout Projections CLI
//!
//! Inspects and repairs a projection store on disk.
//!
//! ## Usage
//!
//! ```bash
//! # First page of a group's feed, as a member
//! hangout-projections feed --group g1 --user alice
//!
//! # Next page
//! hangout-projections feed --group g1 --user alice --cursor eyJlbnRpdHlJZCI6...
//!
//! # Past hangouts
//! hangout-projections feed --group g1 --user alice --direction backward
//!
//! # Rebuild a drifted hangout pointer in every group it belongs to
//! hangout-projections resync-hangout --hangout h42
//!
//! # Rebuild a series pointer in one group
//! hangout-projections resync-series --group g1 --series s7
//!
//! # Dump one raw row
//! hangout-projections show --pk GROUP#g1 --sk HANGOUT#h42
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hangout_projections::events::spawn_logging_listener;
use hangout_projections::model::{now_millis, ItemKey};
use hangout_projections::{Config, Engine, FeedDirection};

#[derive(Parser, Debug)]
#[command(name = "hangout-projections")]
#[command(about = "Projection consistency engine for group hangouts")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "HANGOUT_PROJECTIONS_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "HANGOUT_PROJECTIONS_DIR")]
    storage_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `hangout_projections=trace`
    #[arg(long, default_value = "hangout_projections=info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print one page of a group's feed as JSON
    Feed {
        #[arg(long)]
        group: String,

        /// User the feed is read as
        #[arg(long)]
        user: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Token from a previous page
        #[arg(long)]
        cursor: Option<String>,

        #[arg(long, default_value = "forward")]
        direction: FeedDirection,

        /// Reference time in Unix millis (defaults to now)
        #[arg(long)]
        now: Option<i64>,
    },

    /// Recompute a hangout pointer from canonical rows
    ResyncHangout {
        #[arg(long)]
        hangout: String,

        /// Only this group; every associated group when omitted
        #[arg(long)]
        group: Option<String>,
    },

    /// Recompute a series pointer from its member pointers
    ResyncSeries {
        #[arg(long)]
        group: String,

        #[arg(long)]
        series: String,
    },

    /// Print one stored row as JSON
    Show {
        #[arg(long)]
        pk: String,

        #[arg(long)]
        sk: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(args.log.parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("creating {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let engine = Engine::open(config)?;
    let _listener = spawn_logging_listener(&engine.events);

    match args.command {
        Command::Feed {
            group,
            user,
            limit,
            cursor,
            direction,
            now,
        } => {
            let page = engine
                .feed(
                    &user,
                    &group,
                    now.unwrap_or_else(now_millis),
                    limit,
                    cursor.as_deref(),
                    direction,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Command::ResyncHangout { hangout, group } => {
            let pointers = match group {
                Some(group) => vec![engine.resync_hangout(&group, &hangout).await?],
                None => engine.resync_hangout_everywhere(&hangout).await?,
            };
            for pointer in &pointers {
                info!(key = %pointer.key, version = pointer.version, "Resynced");
            }
            println!("{}", serde_json::to_string_pretty(&pointers.iter().map(|p| &p.value).collect::<Vec<_>>())?);
        }
        Command::ResyncSeries { group, series } => {
            let pointer = engine.resync_series(&group, &series).await?;
            println!("{}", serde_json::to_string_pretty(&pointer.value)?);
        }
        Command::Show { pk, sk } => {
            let key = ItemKey::new(pk, sk);
            match engine.get(&key).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("no row at {}", key),
            }
        }
    }

    // Let the logging listener drain queued signals
    tokio::task::yield_now().await;

    Ok(())
}
