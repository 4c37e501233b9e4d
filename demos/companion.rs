use std::{env, sync::Arc};
use tracing::{error, info, warn};
use wearlink::{
    ble::BtleplugTransport,
    sink::{HttpSink, KeyValueTokenStore},
    storage::MemoryStore,
    ConnectionSupervisor, DataSyncService, Result, SinkConfig, SupervisorConfig, SyncConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("⌚ Wearlink Companion Example");

    let store = Arc::new(MemoryStore::default());
    let tokens = KeyValueTokenStore::new(store.clone());
    if let Ok(token) = env::var("WEARLINK_TOKEN") {
        tokens.save_access_token(&token).await?;
    }

    let sink_config = SinkConfig {
        base_url: env::var("WEARLINK_API").unwrap_or_else(|_| SinkConfig::default().base_url),
        ..Default::default()
    };
    let sink = Arc::new(HttpSink::new(&sink_config, Arc::new(tokens))?);
    info!("Uploading to {}", sink.endpoint());

    let sync = DataSyncService::new(sink, SyncConfig::default());
    let transport = Arc::new(BtleplugTransport::new().await?);
    let supervisor = ConnectionSupervisor::new(transport, store, sync, SupervisorConfig::default());

    if supervisor.restore().await?.is_none() {
        info!("Searching for wearables...");
        let found = supervisor.scan(supervisor.config().scan_timeout()).await?;
        let Some(first) = found.first() else {
            error!("❌ No wearable found");
            return Ok(());
        };
        info!("Found {} ({} dBm)", first.name, first.rssi);
        supervisor.connect(&first.id, &first.name).await?;
    }

    supervisor.start_monitoring().await;
    match supervisor.refresh_battery().await {
        Ok(level) => info!("🔋 Battery: {}%", level),
        Err(e) => warn!("Battery level unavailable: {}", e),
    }

    info!("Streaming health data, press Ctrl+C to stop");
    let mut samples = supervisor.watch_latest_sample();
    let mut state = supervisor.watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = state.changed() => {
                info!("Connection: {}", *state.borrow_and_update());
            }
            Ok(()) = samples.changed() => {
                let latest = samples.borrow_and_update().clone();
                if let Some(sample) = latest {
                    println!(
                        "❤️ {:3} bpm  🫁 {:3}%  👣 {:6}  🔥 {:6.1} kcal  (pending: {})",
                        sample.heart_rate,
                        sample.spo2,
                        sample.steps,
                        sample.calories,
                        supervisor.pending_count().await
                    );
                }
            }
        }
    }

    info!("Uploading remaining samples before exit");
    match supervisor.force_sync().await {
        Ok(count) => info!("✅ Uploaded {} samples", count),
        Err(e) => warn!("Final upload failed: {}", e),
    }
    supervisor.shutdown().await;

    Ok(())
}
