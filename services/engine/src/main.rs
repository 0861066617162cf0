//! redcap-synth
//!
//! Synthesizes the stacks of a REDCap stage into template files and derives
//! the secrets operators need alongside them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use redcap_engine::signing::{cron_token, smtp_password};
use redcap_engine::{synth_app, App, LookupContext, StagesFile, SynthMode, SynthOptions};

#[derive(Parser, Debug)]
#[command(name = "redcap-synth", version, about = "Plan a REDCap deployment on AWS")]
struct Cli {
    /// Stage file
    #[arg(long, global = true, default_value = "stages.yaml", env = "REDCAP_STAGES_FILE")]
    stages_file: PathBuf,

    /// Hosted zone lookup context
    #[arg(long, global = true, env = "REDCAP_LOOKUPS_FILE")]
    lookups: Option<PathBuf>,

    /// Account id written into build settings instead of ${AWS::AccountId}
    #[arg(long, global = true, env = "AWS_ACCOUNT_ID")]
    account_id: Option<String>,

    /// Debug logging
    #[arg(long, short, global = true, default_value = "false")]
    verbose: bool,

    /// JSON log lines
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write every stack template of a stage plus manifest.json
    Synth {
        #[arg(long, env = "REDCAP_STAGE")]
        stage: String,

        /// Output directory
        #[arg(long, default_value = "cdk.out")]
        out: PathBuf,

        #[arg(long, value_enum, default_value_t = SynthMode::Deploy)]
        mode: SynthMode,
    },
    /// Evaluate a stage without writing anything
    Validate {
        #[arg(long, env = "REDCAP_STAGE")]
        stage: String,

        #[arg(long, value_enum, default_value_t = SynthMode::Deploy)]
        mode: SynthMode,
    },
    /// Print the cron endpoint token for a secret
    CronToken {
        #[arg(long)]
        secret: String,
    },
    /// Derive the SES SMTP password from a secret access key
    SmtpPassword {
        #[arg(long)]
        region: String,

        #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: String,
    },
    /// List stage names and kinds
    Stages,
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn plan(cli: &Cli, stage: &str, mode: SynthMode) -> Result<App> {
    let stages = StagesFile::load(&cli.stages_file)
        .await
        .with_context(|| format!("Failed to load stage file {}", cli.stages_file.display()))?;
    let settings = stages
        .stage(stage)
        .with_context(|| format!("Invalid settings for stage {}", stage))?;

    let lookups = match &cli.lookups {
        Some(path) => LookupContext::load(path)
            .await
            .with_context(|| format!("Failed to load lookups {}", path.display()))?,
        None => LookupContext::default(),
    };
    if lookups.is_empty() {
        info!("No hosted zone lookups provided");
    }

    let options = SynthOptions::new(mode, cli.account_id.clone());
    let app = synth_app(stage, &settings, &lookups, &options)
        .with_context(|| format!("Synthesis of stage {} failed", stage))?;
    Ok(app)
}

async fn write_app(app: &App, out: &Path) -> Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    for (file_name, document) in app.documents() {
        let path = out.join(&file_name);
        tokio::fs::write(&path, serde_json::to_string_pretty(&document)?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(template = %path.display(), "Wrote stack template");
    }

    let manifest = out.join("manifest.json");
    tokio::fs::write(&manifest, serde_json::to_string_pretty(&app.manifest())?)
        .await
        .with_context(|| format!("Failed to write {}", manifest.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match &cli.command {
        Command::Synth { stage, out, mode } => {
            let app = plan(&cli, stage, *mode).await?;
            write_app(&app, out).await?;
            info!(
                stage = %stage,
                stacks = app.stacks.len(),
                out = %out.display(),
                "Synthesis complete"
            );
        }
        Command::Validate { stage, mode } => {
            let app = plan(&cli, stage, *mode).await?;
            for name in app.stack_names() {
                println!("{}", name);
            }
            info!(stage = %stage, "Stage is valid");
        }
        Command::CronToken { secret } => {
            println!("{}", cron_token(secret)?);
        }
        Command::SmtpPassword {
            region,
            secret_access_key,
        } => {
            println!("{}", smtp_password(secret_access_key, region)?);
        }
        Command::Stages => {
            let stages = StagesFile::load(&cli.stages_file)
                .await
                .with_context(|| format!("Failed to load stage file {}", cli.stages_file.display()))?;
            for name in stages.stage_names() {
                match stages.stage(name) {
                    Ok(settings) => println!("{}\t{}\t{}", name, settings.kind(), settings.region()),
                    Err(e) => {
                        warn!(stage = %name, error = %e, "Stage does not validate");
                        println!("{}\tinvalid", name);
                    }
                }
            }
        }
    }

    Ok(())
}
