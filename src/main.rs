mod cli;

use std::{process, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, metadata::LevelFilter};

use cli::{Args, Commands, ConfigAction};
use lora_gen::core::{AppState, Secrets, SettingsManager};
use lora_gen::generation::GenerationRequest;

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        LevelFilter::DEBUG
    } else {
        std::env::var("LORA_GEN_LOG")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(LevelFilter::INFO)
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let settings = Arc::new(match &args.config {
        Some(path) => SettingsManager::open(path)?,
        None => SettingsManager::new()?,
    });

    if let Commands::Config { action } = &args.command {
        return match action {
            ConfigAction::Show => print_json(&settings.read()),
            ConfigAction::Init => {
                if settings.init()? {
                    println!("wrote {}", settings.path().display());
                } else {
                    println!("{} already exists", settings.path().display());
                }
                Ok(())
            }
        };
    }

    let state = AppState::new(settings.clone(), Secrets::from_env())?;

    match args.command {
        Commands::Generate {
            owner,
            model,
            prompt,
            count,
            requester,
        } => {
            state.probe_store().await;
            let mut request = GenerationRequest::new(owner, model, prompt, count);
            if let Some(requester) = requester {
                request = request.with_requester(requester);
            }
            let usage = state.generation().run(&request).await?;
            print_json(&usage)
        }
        Commands::Resolve { content_id } => {
            let path = state.cache().resolve(&content_id).await?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Sweep { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.read().max_cache_age());
            let removed = state.cache().sweep(max_age).await?;
            println!("{removed}");
            Ok(())
        }
        Commands::Evict { content_id } => {
            let removed = state.cache().evict(&content_id).await?;
            if !removed {
                info!(content_id = %content_id, "nothing cached under that id");
            }
            Ok(())
        }
        Commands::Assets => print_json(&state.cache().scan().await?),
        Commands::History { address } => {
            print_json(&state.generation().usage_for(&address).await?)
        }
        Commands::RunSweeper => {
            let sweeper = state.spawn_sweeper();
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt signal")?;
            info!("interrupt received; stopping sweeper");
            sweeper.shutdown().await;
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(args.verbose);

    if let Err(err) = run(args).await {
        error!("{err:#}");
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
