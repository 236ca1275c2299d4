use ecash_wallet_sync::config::{SyncConfig, wallet_from_env};
use ecash_wallet_sync::wallet::sync::{SchedulerCommand, SyncScheduler, TracingNotificationSink};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// Info by default, overridable through RUST_LOG
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting eCash wallet sync service");

	let config = match SyncConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return;
		}
	};

	let wallet = match wallet_from_env() {
		Ok(wallet) => wallet,
		Err(e) => {
			error!("Invalid wallet: {}", e);
			return;
		}
	};

	let scheduler = match SyncScheduler::from_config(config, Arc::new(TracingNotificationSink)) {
		Ok(scheduler) => scheduler,
		Err(e) => {
			error!("Failed to create sync scheduler: {}", e);
			return;
		}
	};

	let mut view = scheduler.subscribe_view();
	let (commands, receiver) = mpsc::channel(8);
	let runner = tokio::spawn(scheduler.run(receiver));

	if commands
		.send(SchedulerCommand::ActivateWallet(wallet))
		.await
		.is_err()
	{
		error!("Sync scheduler stopped before the wallet was activated");
		return;
	}

	let ctrl_c = tokio::signal::ctrl_c();
	tokio::pin!(ctrl_c);

	loop {
		tokio::select! {
			changed = view.changed() => {
				if changed.is_err() {
					break;
				}
				let current = view.borrow_and_update().clone();
				info!(
					"{}: {} XEC, {} tokens, {} history entries{}",
					current.wallet_name.as_deref().unwrap_or("-"),
					current.balance.spendable_display,
					current.tokens.len(),
					current.history.len(),
					if current.api_error { " (indexer error)" } else { "" }
				);
			}
			_ = &mut ctrl_c => {
				info!("Interrupted, shutting down");
				let _ = commands.send(SchedulerCommand::Shutdown).await;
				break;
			}
		}
	}

	if let Err(e) = runner.await {
		error!("Sync scheduler task failed: {}", e);
	}
}
