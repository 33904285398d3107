use std::time::Duration;

use clap::{Parser, Subcommand};

use jobwatch_lib::config::MonitorConfig;
use jobwatch_lib::error::AppError;
use jobwatch_lib::poller::PollPeriods;

#[derive(Parser)]
#[command(name = "jobwatch", version, about = "Monitor and trigger the Cloud Run batch job")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default).
    Serve,
    /// Poll a running server and print job progress.
    Watch {
        #[arg(long, env = "JOBWATCH_URL", default_value = "http://localhost:8080")]
        url: String,
        /// Poll period while an execution is running, in seconds.
        #[arg(long, default_value_t = 5)]
        active_secs: u64,
        /// Poll period while idle, in seconds.
        #[arg(long, default_value_t = 30)]
        idle_secs: u64,
        /// Log lines to print per refresh.
        #[arg(long, default_value_t = 15)]
        log_lines: usize,
    },
    /// Start the job once through a running server.
    Trigger {
        #[arg(long, env = "JOBWATCH_URL", default_value = "http://localhost:8080")]
        url: String,
    },
}

fn main() {
    // `.env` must be loaded before SENTRY_DSN and clap's env-backed args are read.
    let _ = dotenvy::dotenv();

    // Initialize Sentry before anything else so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent (local dev).
    let _sentry_guard = sentry::init(sentry_options());

    let cli = Cli::parse();
    jobwatch_lib::logging::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        tracing::error!(kind = e.kind(), "{}", e);
        std::process::exit(if e.is_conflict() { 2 } else { 1 });
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => jobwatch_lib::serve(MonitorConfig::from_env()?).await,
        Command::Watch { url, active_secs, idle_secs, log_lines } => {
            let periods = PollPeriods {
                active: Duration::from_secs(active_secs.max(1)),
                idle: Duration::from_secs(idle_secs.max(1)),
            };
            jobwatch_lib::watch(&url, periods, log_lines).await
        }
        Command::Trigger { url } => {
            let outcome = jobwatch_lib::trigger_once(&url).await?;
            println!("Triggered {} (operation {})", outcome.job, outcome.operation);
            Ok(())
        }
    }
}

fn sentry_options() -> sentry::ClientOptions {
    sentry::ClientOptions {
        dsn: std::env::var("SENTRY_DSN").ok().and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(std::sync::Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            if let Some(ref mut request) = event.request {
                request.data = None;
            }
            Some(event)
        })),
        ..Default::default()
    }
}
