use std::sync::Arc;

use dashlink::camera::client::FrameExtractor;
use dashlink::config::Config;
use dashlink::mqtt::client::StateSynchronizer;
use dashlink::telemetry::{LED_COUNT, TelemetryState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting dashlink (mqtt={}, prefix={}, camera={})",
        config.mqtt.broker,
        config.mqtt.topic_prefix,
        config.camera.as_ref().map_or("disabled", |c| c.url.as_str()),
    );

    let shutdown = CancellationToken::new();
    let state = TelemetryState::new();
    let sync = Arc::new(StateSynchronizer::new(
        &config.mqtt,
        config.topic_bindings(),
        state.clone(),
    ));

    // Connect in the background so the camera and observers start at once.
    let connect_handle = {
        let sync = sync.clone();
        let broker = config.mqtt.broker.clone();
        let keep_alive = config.mqtt.keep_alive;
        tokio::spawn(async move {
            if let Err(e) = sync.connect_with_backoff(&broker, keep_alive).await {
                warn!("Gave up connecting to {}: {}", broker, e);
            }
        })
    };

    let observer_handle = {
        let mut rx = state.subscribe();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snap = *rx.borrow_and_update();
                        info!(
                            "temp={:.1} humi={:.1} pot={} relay={} leds={} connected={}",
                            snap.temperature,
                            snap.humidity,
                            snap.potentiometer,
                            if snap.relay { "ON" } else { "OFF" },
                            snap.leds.iter().map(|on| if *on { '1' } else { '0' }).collect::<String>(),
                            snap.connected,
                        );
                    }
                }
            }
        })
    };

    let mut extractor = match &config.camera {
        Some(camera) => match FrameExtractor::spawn(camera.clone()) {
            Ok(extractor) => Some(extractor),
            Err(e) => {
                error!("Camera disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let frame_handle = extractor.as_ref().map(|extractor| {
        let mut frames = extractor.subscribe();
        tokio::spawn(async move {
            while let Some(frame) = frames.next_frame().await {
                match frame.dimensions {
                    Some((w, h)) => info!("Frame {} ({} bytes, {}x{})", frame.sequence, frame.len(), w, h),
                    None => info!("Frame {} ({} bytes)", frame.sequence, frame.len()),
                }
            }
            if frames.dropped() > 0 {
                info!("Frame consumer dropped {} stale frames", frames.dropped());
            }
        })
    });

    // Typing 1..8 on stdin toggles the matching LED. Stdin is read on a
    // plain thread so a pending read never holds up runtime shutdown.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    let input_handle = {
        let sync = sync.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                match line.trim().parse::<usize>() {
                    Ok(n) if (1..=LED_COUNT).contains(&n) => match sync.toggle(n - 1) {
                        Ok(outcome) => info!(
                            "LED {} -> {}{}",
                            n,
                            if outcome.on { "ON" } else { "OFF" },
                            if outcome.queued { "" } else { " (not sent)" }
                        ),
                        Err(e) => warn!("{}", e),
                    },
                    _ => warn!("Type an LED number 1-{} to toggle it", LED_COUNT),
                }
            }
        })
    };

    wait_for_signal().await;

    shutdown.cancel();
    sync.stop().await;
    if let Some(extractor) = extractor.as_mut() {
        extractor.stop().await;
    }
    connect_handle.abort();
    input_handle.abort();
    let _ = observer_handle.await;
    if let Some(handle) = frame_handle {
        let _ = handle.await;
    }
    info!("dashlink stopped");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT, shutting down");
                    }
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
        }
    }
}
