// --- Playback widget bridge -------------------------------------------------
//
// The video player runs in a browser overlay. It connects to /ws/overlay,
// receives load/play/stop commands as JSON text frames, and sends back
// `WidgetReport`s (state changes and periodic position updates).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::events::EngineEvent;
use crate::platform::Player;
use crate::playback::WidgetReport;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum PlayerCommand {
    Load { video_id: String },
    Play,
    Stop,
}

/// [`Player`] that fans commands out to every connected overlay.
#[derive(Clone)]
pub struct OverlayPlayer {
    commands: broadcast::Sender<PlayerCommand>,
}

impl OverlayPlayer {
    pub fn new() -> Self {
        let (commands, _) = broadcast::channel(32);
        Self { commands }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerCommand> {
        self.commands.subscribe()
    }

    fn send(&self, cmd: PlayerCommand) -> bool {
        match self.commands.send(cmd) {
            Ok(_) => true,
            Err(broadcast::error::SendError(cmd)) => {
                debug!("no overlay connected; dropped {cmd:?}");
                false
            }
        }
    }
}

impl Default for OverlayPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Player for OverlayPlayer {
    fn load(&self, video_id: &str) -> bool {
        self.send(PlayerCommand::Load {
            video_id: video_id.to_string(),
        })
    }

    fn play(&self) {
        self.send(PlayerCommand::Play);
    }

    fn stop(&self) {
        self.send(PlayerCommand::Stop);
    }
}

pub async fn overlay_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| overlay_session(socket, state))
}

async fn overlay_session(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    info!("overlay {id} connected");

    let (mut sink, mut stream) = socket.split();
    let mut commands = state.player.subscribe();

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Ok(cmd) => {
                    let text = match serde_json::to_string(&cmd) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("failed to encode {cmd:?}: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("overlay {id} missed {n} commands");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<WidgetReport>(&text) {
                    Ok(report) => {
                        debug!("overlay {id}: {report:?}");
                        if state.events.send(EngineEvent::Widget(report)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("overlay {id} sent an unreadable report: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("overlay {id} socket error: {e}");
                    break;
                }
            },
        }
    }

    info!("overlay {id} disconnected");
}
