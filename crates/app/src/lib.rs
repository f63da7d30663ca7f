use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use upscaler_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use upscaler_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use upscaler_core::server::{app_router, app_state};
use upscaler_core::{EsrganUpscaler, ModelChoice, ScaleFactor, UpscaleOptions};

#[derive(Parser)]
#[command(
    name = "upscaler",
    about = "Real-ESRGAN image upscaling with a Lanczos fallback"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve(ServeArgs),
    /// Upscale a single image file.
    Upscale(UpscaleArgs),
    /// Download weight files ahead of the first request.
    FetchWeights(FetchWeightsArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

impl ServeArgs {
    /// Fill unset values from the top-level flags.
    fn or(self, fallback: ServeArgs) -> ServeArgs {
        ServeArgs {
            port: self.port.or(fallback.port),
            host: self.host.or(fallback.host),
        }
    }
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image (png, jpeg, webp or bmp)")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output PNG path [default: upscaled_x{scale}.png]")]
    output: Option<PathBuf>,
    #[arg(long, default_value = "2", value_parser = parse_scale)]
    scale: ScaleFactor,
    #[arg(long, default_value = "auto", value_parser = parse_model_choice)]
    model: ModelChoice,
    #[arg(long, help = "Never use a GPU execution provider")]
    cpu: bool,
    #[arg(long = "no-preserve-aspect")]
    no_preserve_aspect: bool,
}

#[derive(Args)]
struct FetchWeightsArgs {
    #[arg(
        long = "scale",
        value_name = "N",
        value_parser = parse_scale,
        help = "Scale to fetch (repeatable; default: all)"
    )]
    scales: Vec<ScaleFactor>,
}

fn parse_scale(raw: &str) -> Result<ScaleFactor> {
    raw.parse()
}

fn parse_model_choice(raw: &str) -> Result<ModelChoice> {
    raw.parse()
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    upscaler_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    upscaler_core::runtime::log_runtime_lib_status();
    log_startup_metadata(command_name(cli.command.as_ref()), &resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    let cancel = CancellationToken::new();
    spawn_ctrl_c_watcher(cancel.clone());

    match cli.command {
        Some(Commands::Upscale(args)) => {
            run_upscale(args, &config, &resolved_data_dir, cancel).await
        }
        Some(Commands::FetchWeights(args)) => {
            run_fetch_weights(args, &config, &resolved_data_dir, cancel).await
        }
        Some(Commands::Serve(args)) => {
            run_server(args.or(cli.serve), config, resolved_data_dir, cancel).await
        }
        None => run_server(cli.serve, config, resolved_data_dir, cancel).await,
    }
}

fn command_name(command: Option<&Commands>) -> &'static str {
    match command {
        Some(Commands::Upscale(_)) => "upscale",
        Some(Commands::FetchWeights(_)) => "fetch-weights",
        Some(Commands::Serve(_)) | None => "serve",
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::compose_log_filter(&options);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
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
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
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

fn log_startup_metadata(command: &str, data_dir: &Path) {
    info!(
        command,
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn spawn_ctrl_c_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
    });
}

async fn run_server(
    args: ServeArgs,
    config: AppConfig,
    data_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = args.host.unwrap_or_else(|| config.server.host.clone());

    let upscaler = EsrganUpscaler::from_config(&config, &data_dir, cancel.clone())?;
    let defaults = UpscaleOptions {
        use_gpu: config.inference.prefer_gpu,
        ..UpscaleOptions::default()
    };
    let app = app_router(app_state(upscaler, defaults, config.server.max_upload_bytes));

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting upscaler server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}

fn upscale_options(args: &UpscaleArgs, config: &AppConfig) -> UpscaleOptions {
    UpscaleOptions {
        scale: args.scale,
        model_choice: args.model,
        use_gpu: config.inference.prefer_gpu && !args.cpu,
        preserve_aspect: !args.no_preserve_aspect,
    }
}

async fn run_upscale(
    args: UpscaleArgs,
    config: &AppConfig,
    data_dir: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let options = upscale_options(&args, config);
    let input = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("failed to read input image: {}", args.input.display()))?;

    let upscaler = EsrganUpscaler::from_config(config, data_dir, cancel)?;
    let started = std::time::Instant::now();
    let result = tokio::task::spawn_blocking(move || upscaler.upscale_to_png(&input, &options))
        .await
        .context("upscale task panicked")??;

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(&result.filename));
    tokio::fs::write(&output, &result.bytes)
        .await
        .with_context(|| format!("failed to write output image: {}", output.display()))?;

    if let Some(reason) = result.fallback_reason.as_deref() {
        warn!(%reason, "Model path unavailable; output was produced by Lanczos resampling");
    }
    info!(
        output = %output.display(),
        path = %result.path,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Upscale complete"
    );
    eprintln!("Wrote {} ({})", output.display(), result.path);
    Ok(())
}

async fn run_fetch_weights(
    args: FetchWeightsArgs,
    config: &AppConfig,
    data_dir: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let scales = if args.scales.is_empty() {
        ScaleFactor::ALL.to_vec()
    } else {
        args.scales
    };

    let upscaler = EsrganUpscaler::from_config(config, data_dir, cancel)?;
    let failures = tokio::task::spawn_blocking(move || {
        let provisioner = upscaler.provisioner();
        let mut failures = Vec::new();
        for scale in scales {
            match provisioner.ensure_weights(scale) {
                Ok(path) => {
                    info!(%scale, path = %path.display(), "Weights ready");
                    eprintln!("{scale}: {}", path.display());
                }
                Err(error) => {
                    warn!(%scale, error = %error, "Failed to provision weights");
                    failures.push(format!("{scale}: {error}"));
                }
            }
        }
        failures
    })
    .await
    .context("weight fetch task panicked")?;

    if !failures.is_empty() {
        bail!("failed to provision weights:\n  {}", failures.join("\n  "));
    }
    Ok(())
}
