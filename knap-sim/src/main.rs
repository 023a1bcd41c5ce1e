// Knap simulator: pairs simulated buttons with a manager over a loopback radio
// and logs every notification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use knap_core::identity::BdAddr;
use knap_core::protocol::EventKind;
use knap_core::registry::{ButtonManager, ManagerEvent};
use knap_core::session::Notification;
use knap_sim::{config, LoopbackTransport, SimButton};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("knap-sim {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    info!(?cfg, "Starting simulator");

    let rt = tokio::runtime::Runtime::new().context("start runtime")?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (radio, radio_events) = LoopbackTransport::new();
    let (manager, notifications) = ButtonManager::new(Arc::new(radio.clone()), cfg.manager.clone());

    for i in 0..cfg.buttons {
        let index = u8::try_from(i).context("too many simulated buttons")?;
        let address = BdAddr::new([0x00, 0x80, 0xe4, 0xda, 0x00, index]);
        let (device, pairing) = SimButton::pair(address, &format!("sim-{i}"));
        radio.add_button(device);
        let handle = manager.add_button(pairing)?;
        handle.set_trigger_mode(cfg.trigger_mode)?;
        handle.connect()?;
    }

    let pump = manager.clone();
    tokio::spawn(async move { pump.pump(radio_events).await });
    tokio::spawn(log_notifications(manager.clone(), notifications));
    tokio::spawn(press_buttons(radio, cfg.click_interval_ms));

    shutdown_signal().await?;
    info!("Shutting down");
    for handle in manager.buttons() {
        let _ = manager.remove_button(handle.id());
    }
    Ok(())
}

/// Log every notification. A button lost to range is re-armed so it reconnects
/// once it is back.
async fn log_notifications(manager: ButtonManager, mut rx: mpsc::UnboundedReceiver<ManagerEvent>) {
    while let Some(ManagerEvent { button, notification }) = rx.recv().await {
        match notification {
            Notification::Button(event) => info!(
                %button,
                kind = ?event.kind,
                queued = event.queued,
                age_secs = event.age_secs,
                press_count = event.press_count,
                "Button event"
            ),
            Notification::BatteryLevel(level) => info!(
                %button,
                volts = knap_core::session::battery_voltage(level),
                "Battery"
            ),
            Notification::Disconnected(Some(cause)) if !cause.is_expected() => {
                info!(%button, %cause, "Disconnected, waiting for the button");
                if let Some(handle) = manager.button(button) {
                    let _ = handle.connect();
                }
            }
            other => info!(%button, notification = ?other, "Session"),
        }
    }
}

/// Press random buttons forever; now and then take one out of range for a while
/// so it queues presses.
async fn press_buttons(radio: LoopbackTransport, interval_ms: u64) {
    let kinds = [EventKind::Click, EventKind::DoubleClick, EventKind::Hold];
    let mut away: Option<BdAddr> = None;
    loop {
        let (wait, address, kind, roll) = {
            let mut rng = rand::thread_rng();
            let addresses = radio.addresses();
            let Some(address) = addresses.choose(&mut rng).copied() else {
                return;
            };
            let wait = rng.gen_range(interval_ms / 2..=interval_ms + interval_ms / 2);
            let kind = kinds.choose(&mut rng).copied().unwrap_or(EventKind::Click);
            (wait, address, kind, rng.gen_range(0..20u8))
        };
        tokio::time::sleep(Duration::from_millis(wait)).await;
        radio.advance(wait);
        if roll == 0 {
            if let Some(back) = away.take() {
                info!(address = %back, "Button back in range");
                radio.set_in_range(back, true);
            } else {
                info!(%address, "Button out of range");
                radio.set_in_range(address, false);
                away = Some(address);
            }
        }
        radio.press(address, EventKind::Down);
        radio.press(address, EventKind::Up);
        radio.press(address, kind);
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
