//! fanout-poll - submit a prompt to a running server and wait for the images.
//!
//! Usage: `fanout-poll <prompt...>`
//!
//! Environment:
//! - `FANOUT_SERVER_URL` - Server root. Defaults to `http://127.0.0.1:3000`.
//! - `FANOUT_STYLE` - Optional. `cute`, `toy` or `cyber`.
//! - `FANOUT_WIDTH` - Optional. Variants to generate. Defaults to `3`.
//! - `FANOUT_MIN_SUCCESS` - Optional. Variants required. Defaults to `2`.
//! - `FANOUT_MAX_WAIT_SECS` - Optional. Client-side budget. Defaults to `300`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use fanout_orchestrator::client::{HttpTaskApi, PollConfig, PollOutcome, PollingClient};
use fanout_orchestrator::task::{Style, TaskRequest};
use fanout_orchestrator::util::{env_var_parse, env_var_secs};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        bail!("usage: fanout-poll <prompt...>");
    }

    let server = std::env::var("FANOUT_SERVER_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());
    let width: usize = env_var_parse("FANOUT_WIDTH", 3)?;
    let min_success: usize = env_var_parse("FANOUT_MIN_SUCCESS", 2)?;
    let max_wait = env_var_secs("FANOUT_MAX_WAIT_SECS", Duration::from_secs(300))?;

    let mut request = TaskRequest::new(prompt, width).with_min_success(min_success);
    if let Ok(raw) = std::env::var("FANOUT_STYLE") {
        let style = Style::parse(&raw).with_context(|| format!("unknown style: {}", raw))?;
        request = request.with_style(style);
    }

    let api = HttpTaskApi::new(&server)?;
    let client = PollingClient::new(
        Arc::new(api),
        PollConfig {
            max_wait,
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let (id, outcome) = client
        .submit_and_wait(&request, &cancel, |snapshot| {
            eprintln!("{} {:>3}% {}", snapshot.task_id, snapshot.progress, snapshot.status);
        })
        .await?;

    match outcome {
        PollOutcome::Completed(snapshot) => {
            for result in snapshot.results {
                println!("{}", result);
            }
            Ok(())
        }
        PollOutcome::Failed(snapshot) => bail!(
            "task {} failed: {}",
            id,
            snapshot.error_message.unwrap_or_else(|| "unknown error".to_string())
        ),
        PollOutcome::Expired => bail!("task {} expired on the server, submit it again", id),
        PollOutcome::TimedOut(_) => bail!("gave up waiting for task {}; it is still running", id),
        PollOutcome::Cancelled(_) => bail!("stopped waiting for task {}; it is still running", id),
        PollOutcome::Unreachable(reason) => bail!("server unreachable: {}", reason),
    }
}
