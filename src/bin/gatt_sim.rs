// src/bin/gatt_sim.rs
//! Drives a simulated GATT session end to end and logs every outcome.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --bin gatt_sim [config.json]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use gattlink::gatt::simulated::{SimPeer, SimTransport};
use gattlink::{
    CharacteristicId, ChannelConfig, GattChannel, NotificationMode, OperationKind, WriteOptions,
};

const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path))?;
            ChannelConfig::from_json(&json).with_context(|| format!("parsing config {}", path))?
        }
        None => ChannelConfig {
            operation_timeout: Some(Duration::from_secs(5)),
            ..ChannelConfig::default()
        },
    };

    let battery = CharacteristicId::new(BATTERY_SERVICE, BATTERY_LEVEL);
    let peer = Arc::new(
        SimPeer::new()
            .with_characteristic(battery, vec![87])
            .with_latency(Duration::from_millis(20)),
    );

    let (_radio_off_tx, radio_off) = watch::channel(false);
    let transport = SimTransport::new();
    let channel = GattChannel::new(transport.clone(), radio_off, config);
    let _responder = Arc::clone(&peer).attach(Arc::clone(&channel), transport);

    channel.connect().await?;
    log::info!("MTU negotiated: {}", channel.request_mtu(247).await?);
    log::info!("RSSI: {} dBm", channel.read_rssi().await?);

    let level = channel.read_characteristic(battery).await?;
    log::info!("Battery level: {}%", level.first().copied().unwrap_or_default());

    // Several callers at once; the channel runs them one after another.
    let mut tasks = Vec::new();
    for level in [80u8, 75, 70] {
        let channel = Arc::clone(&channel);
        tasks.push(tokio::spawn(async move {
            channel
                .write_characteristic(battery, vec![level], WriteOptions::default())
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }
    log::info!("Peer now holds {:?}", peer.value(&battery));

    let mut updates = channel
        .enable_notifications(battery, NotificationMode::Notify)
        .await?;
    peer.notify(&channel, battery, vec![69]);
    if let Some(value) = updates.next().await {
        log::info!("Notification: {:?}", value);
    }

    peer.fail_next(OperationKind::ReadCharacteristic, 0x05);
    match channel.read_characteristic(battery).await {
        Ok(value) => log::info!("Unexpected success: {:?}", value),
        Err(e) => log::warn!("Read failed as scripted: {}", e),
    }

    channel.disconnect().await?;
    log::info!("Session finished: {:?}", channel.connection_state());
    Ok(())
}
