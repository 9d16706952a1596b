use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vmaccess_rotator::azure::ArmClient;
use vmaccess_rotator::config::Config;
use vmaccess_rotator::fleet::FleetDriver;
use vmaccess_rotator::lifecycle::ExtensionLifecycle;
use vmaccess_rotator::{logging, report};

#[tokio::main]
async fn main() {
    let config = Config::from_args();
    logging::init(&config.log_format, &config.log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT"),
        build_date = env!("BUILD_DATE"),
        "VMAccess rotator starting"
    );

    match run(config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = format!("{e:#}"), "Run aborted");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<i32> {
    config.validate().context("Configuration validation failed")?;
    config.display();

    let ssh_key = config.resolve_ssh_key()?;
    let client = ArmClient::new(config.arm_client_config())?;

    let lifecycle = ExtensionLifecycle::new(
        Arc::new(client),
        config.scope(),
        config.descriptor(&ssh_key),
        config.lifecycle_policy(),
    );
    let driver = FleetDriver::new(lifecycle, config.concurrency);

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, &config);

    let result = driver
        .run_pass(&cancel)
        .await
        .context("Failed to list virtual machines")?;

    println!("{}", report::render(&result));

    let code = result.exit_code();
    if code == 0 {
        info!(converged = result.converged_count(), "All virtual machines converged");
    } else {
        warn!(
            converged = result.converged_count(),
            failed = result.failed_count(),
            "Some virtual machines did not converge"
        );
    }

    Ok(code)
}

/// Cancel the pass on Ctrl-C or when the configured deadline passes.
fn spawn_cancel_triggers(cancel: &CancellationToken, config: &Config) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling remaining work");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = config.deadline() {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!(
                deadline_seconds = deadline.as_secs(),
                "Run deadline reached, cancelling remaining work"
            );
            on_deadline.cancel();
        });
    }
}
