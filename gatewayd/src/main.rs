use clap::{Parser, Subcommand};
use gateway::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about = "Edge API gateway for the task management platform")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the gateway
    Run {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Load and validate the configuration, print it and exit
    CheckConfig {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        CliCommand::Run { config } => run(config),
        CliCommand::CheckConfig { config } => check_config(config),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn load_config(path: Option<PathBuf>) -> Option<Config> {
    match Config::load(path.as_deref()) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::error!(error = %e, "Could not load configuration");
            None
        }
    }
}

fn check_config(path: Option<PathBuf>) -> ExitCode {
    let Some(mut config) = load_config(path) else {
        return ExitCode::FAILURE;
    };
    config.jwt_secret = "<redacted>".into();
    println!("{config:#?}");
    ExitCode::SUCCESS
}

fn run(path: Option<PathBuf>) -> ExitCode {
    let Some(config) = load_config(path) else {
        return ExitCode::FAILURE;
    };

    let _sentry = config.logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Could not start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        let metrics = match gateway::metrics::install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Could not install the metrics recorder");
                return ExitCode::FAILURE;
            }
        };

        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            upstreams = config.upstreams.len(),
            "Starting gateway"
        );

        match gateway::run(config, metrics, shutdown_signal()).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e @ gateway::RunError::Bind { .. }) => {
                tracing::error!(error = %e, "Could not bind the listener");
                ExitCode::from(2)
            }
            Err(e) => {
                tracing::error!(error = %e, "Gateway failed to start");
                ExitCode::FAILURE
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
