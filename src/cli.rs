use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "lora-gen",
    about = "Fetch fine-tuned LoRA models from IPFS and generate images with them",
    version
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate images with a trained model and record the usage
    Generate {
        /// Wallet address that owns the model
        #[arg(long)]
        owner: String,

        /// Model name as registered by the training pipeline
        #[arg(long)]
        model: String,

        #[arg(long)]
        prompt: String,

        /// Number of images to generate
        #[arg(long, default_value = "1")]
        count: u32,

        /// Wallet address the images are generated for (defaults to the owner)
        #[arg(long)]
        requester: Option<String>,
    },

    /// Download and validate a model archive, printing its local path
    Resolve { content_id: String },

    /// Remove cached models older than the configured maximum age
    Sweep {
        /// Override the configured maximum age
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Remove one cached model
    Evict { content_id: String },

    /// List cached models
    Assets,

    /// Usage records for a wallet address
    History { address: String },

    /// Sweep the cache periodically until interrupted
    RunSweeper,

    /// Show or initialize the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Write the default settings file if none exists
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate() {
        let args = Args::try_parse_from([
            "lora-gen", "generate", "--owner", "0xA", "--model", "m1", "--prompt", "a cat",
            "--count", "3", "-v",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Commands::Generate {
                owner,
                count,
                requester,
                ..
            } => {
                assert_eq!(owner, "0xA");
                assert_eq!(count, 3);
                assert_eq!(requester, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_global_config_after_subcommand() {
        let args = Args::try_parse_from([
            "lora-gen",
            "config",
            "show",
            "--config",
            "/tmp/c.json",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(
            args.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }

    #[test]
    fn generate_requires_a_prompt() {
        let parsed =
            Args::try_parse_from(["lora-gen", "generate", "--owner", "0xA", "--model", "m1"]);
        assert!(parsed.is_err());
    }
}
