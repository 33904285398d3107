pub mod backend;
pub mod config;
pub mod config_store;
pub mod engine;
pub mod error;
pub mod logging;
pub mod poller;
pub mod server;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use backend::{build_backend, BackendKind};
use config::MonitorConfig;
use engine::{StatusResolver, TriggerGuard, TriggerOutcome};
use error::AppError;
use poller::{HttpStatusClient, PollPeriods, Poller, PollerCommand, StatusClient};

/// Wire the backend, engine and config store together and run the HTTP API
/// until Ctrl-C.
pub async fn serve(config: MonitorConfig) -> Result<(), AppError> {
    tracing::info!(
        job = %config.job.resource_name(),
        port = config.port,
        "Starting jobwatch v{}",
        env!("CARGO_PKG_VERSION")
    );

    let backend = build_backend(BackendKind::from_config(&config), &config)?;
    let resolver = Arc::new(StatusResolver::new(
        backend.clone(),
        config.job.clone(),
        config.log_page_size,
    ));
    let guard = Arc::new(TriggerGuard::new(resolver.clone(), backend, config.job.clone()));
    let config_store = config_store::build_config_store(&config)?;

    let state = server::ApiState {
        status: resolver,
        guard,
        config_store,
    };
    server::serve(state, config.port).await
}

/// Follow the job from a terminal: render progress on every status change.
///
/// Reads commands from stdin: `t` triggers the job, `d` dismisses the
/// current error, `q` quits.
pub async fn watch(base_url: &str, periods: PollPeriods, log_lines: usize) -> Result<(), AppError> {
    let client: Arc<dyn StatusClient> = Arc::new(HttpStatusClient::new(base_url)?);
    let handle = Poller::new(client, periods).spawn();
    let mut view = handle.view();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    tracing::info!(url = %base_url, "Watching job status");

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let text = view.borrow_and_update().render(chrono::Utc::now(), log_lines);
                println!("{text}");
            }
            line = stdin.next_line() => match line?.as_deref().map(str::trim) {
                Some("t") => handle.send(PollerCommand::Trigger).await?,
                Some("d") => handle.send(PollerCommand::DismissError).await?,
                Some("q") | None => break,
                Some(_) => println!("Commands: t = trigger, d = dismiss error, q = quit"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// Ask a running server to start the job once.
pub async fn trigger_once(base_url: &str) -> Result<TriggerOutcome, AppError> {
    HttpStatusClient::new(base_url)?.trigger().await
}
