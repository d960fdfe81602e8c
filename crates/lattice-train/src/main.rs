//! lattice-train binary
//!
//! Exit codes: 0 completed or detached, 1 failed, 2 status unknown after
//! polling, 130 interrupted.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lattice_common::telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
use lattice_train::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let telemetry = init_telemetry(TelemetryConfig::default()).unwrap_or_else(|e| {
        eprintln!("failed to initialize telemetry: {}", e);
        TelemetryGuard::default()
    });

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal.cancel();
        }
    });

    let code = match cli.run(shutdown).await {
        Ok(outcome) => {
            info!(?outcome, "done");
            outcome.exit_code()
        }
        Err(e) => {
            error!(error = %e, job = e.job().unwrap_or(""), "lattice-train failed");
            e.exit_code()
        }
    };

    // Flush batched spans before the runtime goes away.
    match tokio::task::spawn_blocking(move || telemetry.shutdown()).await {
        Ok(Err(e)) => eprintln!("{}", e),
        Err(e) => eprintln!("telemetry shutdown panicked: {}", e),
        Ok(Ok(())) => {}
    }

    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
