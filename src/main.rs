use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};

use whisper_dictate::config::Config;
use whisper_dictate::service::DictationService;
use whisper_dictate::status::StatusBus;
use whisper_dictate::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    println!("✓ Config loaded from ~/.whisper-dictate.toml");

    telemetry::init(&config.telemetry)?;
    tracing::info!("whisper-dictate starting");

    let (status, status_rx) = StatusBus::channel();

    // Status observer: prints every pipeline transition
    std::thread::Builder::new()
        .name("status-observer".to_owned())
        .spawn(move || {
            for event in status_rx {
                println!("[{}] {}", event.state, event.message);
            }
        })?;

    let service = DictationService::new(config, status)?;
    service.start()?;

    let mut toggle = signal(SignalKind::user_defined1())?;
    let mut reload = signal(SignalKind::hangup())?;

    println!("\nwhisper-dictate is running.");
    println!("  SIGUSR1 (kill -USR1 {}): toggle dictation", std::process::id());
    println!("  SIGHUP: reload config");
    println!("  Ctrl+C: exit\n");

    loop {
        tokio::select! {
            _ = toggle.recv() => {
                if let Err(e) = service.toggle_dictation() {
                    tracing::warn!("toggle rejected: {e}");
                }
            }
            _ = reload.recv() => {
                match Config::load() {
                    Ok(new_config) => {
                        if let Err(e) = service.reload_config(new_config) {
                            tracing::error!("config reload failed: {e}");
                        }
                    }
                    Err(e) => tracing::error!("config reload failed: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                println!("\nShutting down...");
                break;
            }
        }
    }

    service.stop()?;
    Ok(())
}
