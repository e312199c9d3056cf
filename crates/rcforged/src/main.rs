use anyhow::{Context, Result};
use clap::Parser;
use rcforge_core::{EventPayload, Topic};
use tracing::info;

use rcforged::{assemble, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    rcforge_core::init_tracing(settings.json, settings.log_level());
    info!(version = rcforge_core::VERSION, "rcforged starting");

    let forge = assemble(&settings).await?;

    let mut discoveries = forge.subscribe_events(Topic::Discovery);
    let log_task = tokio::spawn(async move {
        while let Some(event) = discoveries.recv().await {
            match event.payload {
                EventPayload::DeviceDiscovered { advert } => info!(
                    device_id = %advert.device_id,
                    address = %advert.address,
                    name = %advert.name,
                    "device discovered"
                ),
                EventPayload::DeviceLost { device_id } => {
                    info!(device_id = %device_id, "device lost")
                }
                _ => {}
            }
        }
    });

    forge.start().await.context("Failed to start discovery")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");

    forge.shutdown().await;
    let _ = log_task.await;
    Ok(())
}
