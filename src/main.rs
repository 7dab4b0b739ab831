mod api;
mod config;
mod engine;
mod error;
mod events;
mod overlay;
mod platform;
mod playback;
mod prediction;
mod queue;
mod router;
mod twitch;
mod youtube;

#[cfg(test)]
mod test_support;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::api::{build_router, AppState};
use crate::config::Config;
use crate::engine::{Collaborators, Engine};
use crate::overlay::OverlayPlayer;
use crate::twitch::eventsub::EventSubTransport;
use crate::twitch::helix::HelixClient;
use crate::twitch::{provision_rewards, RewardIds};
use crate::youtube::YouTubeClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = Config::from_env()?;

    let helix = HelixClient::new(&cfg.twitch_client_id, &cfg.twitch_token, &cfg.broadcaster_id);

    // Reuse configured rewards when both ids are given; otherwise start clean.
    let rewards = match (&cfg.song_reward_id, &cfg.skip_reward_id) {
        (Some(song), Some(skip)) => RewardIds {
            song: song.clone(),
            skip: skip.clone(),
        },
        _ => provision_rewards(&helix, &cfg.costs)
            .await
            .context("reward provisioning failed")?,
    };
    info!("song reward {}, skip reward {}", rewards.song, rewards.skip);

    let player = OverlayPlayer::new();
    let deps = Collaborators {
        lookup: Arc::new(YouTubeClient::new(cfg.youtube_api_keys.clone())),
        votes: Arc::new(helix.clone()),
        player: Arc::new(player.clone()),
    };

    let mut engine_cfg = cfg.engine.clone();
    engine_cfg.song_reward_id = rewards.song.clone();
    engine_cfg.skip_reward_id = rewards.skip.clone();

    let (engine, rx) = Engine::new(engine_cfg, deps);
    let events = engine.sender();

    let state = AppState {
        version: version.clone(),
        events: events.clone(),
        status: engine.subscribe(),
        player,
    };

    tokio::spawn(engine.run(rx));

    let transport = EventSubTransport::new(
        cfg.eventsub_url.clone(),
        helix,
        vec![rewards.song, rewards.skip],
        events,
    );
    let transport = tokio::spawn(transport.run());

    let app = build_router(state, &cfg.overlay_dir);

    info!("requestline engine {version} starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).into_future();

    tokio::select! {
        res = server => res?,
        res = transport => {
            // Without the transport no redemptions arrive; treat it as fatal.
            res.context("eventsub task panicked")?.context("eventsub transport stopped")?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("no SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
