use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use avatarflow_core::assemble::SegmentAssembler;
use avatarflow_core::client::{RenderJobClient, SessionId};
use avatarflow_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use avatarflow_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use avatarflow_core::media::FfmpegToolkit;
use avatarflow_core::pipeline::{generate_avatar_video, AvatarRequest};
use avatarflow_core::workflow::{JobGraph, WorkflowParameterizer};

#[derive(Parser)]
#[command(
    name = "avatarflow",
    version,
    about = "Render talking-avatar clips on a render server and stitch them to narration"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render an avatar video from a reference image and narration audio.
    Generate(GenerateArgs),
    /// Trim each segment to its narration and concatenate the result.
    Merge(MergeArgs),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
struct GenerateArgs {
    #[arg(help = "Reference portrait image")]
    ref_image: PathBuf,
    #[arg(help = "Narration audio driving the avatar")]
    ref_audio: PathBuf,
    #[arg(long, help = "API-format workflow JSON (default from config)")]
    workflow: Option<PathBuf>,
    #[arg(long, help = "Directory receiving the rendered files")]
    output_dir: Option<PathBuf>,
    #[arg(long, value_name = "URL", help = "Render server base URL")]
    api_url: Option<String>,
    #[arg(long, value_name = "WxH", help = "Target resolution, e.g. 560x996")]
    resolution: Option<String>,
    #[arg(long, value_name = "SECS", help = "Give up waiting for the job after this long")]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
struct MergeArgs {
    #[arg(long, help = "Directory of .mp4 segments")]
    input_dir: PathBuf,
    #[arg(long, help = "Merged video path")]
    output_file: PathBuf,
    #[arg(long, help = "Root of <project>/<segment>.<ext> narration files")]
    voice_root: Option<PathBuf>,
}

/// Generate settings after applying CLI overrides on top of `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GenerateSettings {
    workflow: PathBuf,
    request: AvatarRequest,
    timeout: Duration,
}

impl GenerateSettings {
    fn resolve(args: GenerateArgs, config: &mut AppConfig) -> Self {
        if let Some(api_url) = args.api_url {
            config.render.base_url = api_url;
        }
        let timeout = args
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.render.completion_timeout());

        Self {
            workflow: args.workflow.unwrap_or_else(|| config.workflow.path.clone()),
            request: AvatarRequest {
                image: args.ref_image,
                audio: args.ref_audio,
                output_dir: args
                    .output_dir
                    .unwrap_or_else(|| config.render.output_dir.clone()),
                resolution: args
                    .resolution
                    .or_else(|| config.workflow.default_resolution.clone()),
            },
            timeout,
        }
    }
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        Commands::Generate(args) => run_generate(args, config),
        Commands::Merge(args) => run_merge(args, config),
    }
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(
            data_dir = %data_dir.display(),
            error = %format!("{error:#}"),
            "could not initialize data directory; using built-in defaults"
        );
        return Ok(AppConfig::default());
    }

    let path = config_path(data_dir);
    AppConfig::load_from_path(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn run_generate(args: GenerateArgs, mut config: AppConfig) -> Result<()> {
    let settings = GenerateSettings::resolve(args, &mut config);

    let graph = JobGraph::load_from_path(&settings.workflow).with_context(|| {
        format!(
            "failed to load workflow {}",
            settings.workflow.display()
        )
    })?;
    let client = RenderJobClient::from_config(&config.render, SessionId::from_clock())
        .context("failed to set up render server client")?;
    let parameterizer = WorkflowParameterizer::new(config.workflow.vocabulary.clone());

    info!(
        server = client.base_url(),
        session = %client.session(),
        workflow = %settings.workflow.display(),
        "starting avatar generation"
    );
    let files = generate_avatar_video(
        &client,
        &parameterizer,
        graph,
        &settings.request,
        settings.timeout,
    )
    .context("avatar generation failed")?;

    for file in &files {
        println!("{}", file.display());
    }
    Ok(())
}

fn run_merge(args: MergeArgs, mut config: AppConfig) -> Result<()> {
    if let Some(voice_root) = args.voice_root {
        config.assembly.voice_root = voice_root;
    }

    let assembler = SegmentAssembler::new(FfmpegToolkit::new(config.tools.dir), config.assembly);
    let output = assembler
        .assemble(&args.input_dir, &args.output_file)
        .with_context(|| {
            format!(
                "failed to merge segments from {}",
                args.input_dir.display()
            )
        })?;

    println!("{}", output.display());
    Ok(())
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}
