use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use server::broadcast::ChannelBroadcaster;
use server::quiz::QuizRoom;
use server::registry;
use server::spy::SpyRoom;

const DEFAULT_REAPER_INTERVAL_SECS: u64 = 900;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if exists
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let reaper_interval = match env::var("GRIDSPY_REAPER_INTERVAL_SECS") {
        Ok(raw) => Duration::from_secs(
            raw.parse()
                .context("GRIDSPY_REAPER_INTERVAL_SECS must be a number of seconds")?,
        ),
        Err(_) => Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
    };
    info!(?reaper_interval, "starting game services");

    let cancel = CancellationToken::new();

    // One broadcaster and one service task per game. The transport
    // layer consumes the outbound receivers and feeds the services.
    let (spy_broadcaster, spy_outbound) = ChannelBroadcaster::channel();
    let (spy_service, spy_loop, spy_reaper) = registry::spawn::<SpyRoom>(
        "spy",
        Arc::new(spy_broadcaster),
        reaper_interval,
        cancel.clone(),
    );

    let (quiz_broadcaster, quiz_outbound) = ChannelBroadcaster::channel();
    let (quiz_service, quiz_loop, quiz_reaper) = registry::spawn::<QuizRoom>(
        "quiz",
        Arc::new(quiz_broadcaster),
        reaper_interval,
        cancel.clone(),
    );

    // No transport is wired up yet; keep the handles and receivers
    // alive so the services stay operational until shutdown.
    let _keep = (spy_service, quiz_service, spy_outbound, quiz_outbound);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();

    let _ = spy_loop.await;
    let _ = spy_reaper.await;
    let _ = quiz_loop.await;
    let _ = quiz_reaper.await;
    Ok(())
}
