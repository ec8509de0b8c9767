//! Standalone persistence worker
//!
//! Reads its `WorkerInit` from the first stdin line, then one request per
//! line. Responses and lifecycle signals go to stdout; logs go to stderr.

use anyhow::Context;
use std::io::{self, BufRead, Write};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use persistence_worker::{worker, WorkerInit};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let stdin = io::stdin();
    let mut input = stdin.lock().lines();

    let init_line = input
        .next()
        .context("stdin closed before init parameters arrived")?
        .context("failed to read init parameters")?;
    let init: WorkerInit =
        serde_json::from_str(&init_line).context("init parameters are not valid JSON")?;

    let requests = input.map_while(|line| match line {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!("Failed to read request line: {}", e);
            None
        }
    });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let code = worker::serve(&init, requests, |line| {
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            tracing::error!("Failed to write to stdout: {}", e);
        }
    });

    std::process::exit(code);
}
