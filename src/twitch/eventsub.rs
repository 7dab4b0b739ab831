use std::future::Future;

use anyhow::Context;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use url::Url;

use super::helix::HelixClient;
use crate::events::{EngineEvent, EventTx, LockOutcome, PredictionLock, Redemption};

pub const REDEMPTION_ADD: &str = "channel.channel_points_custom_reward_redemption.add";
pub const PREDICTION_LOCK: &str = "channel.prediction.lock";

/// Twitch sends a keepalive after 30 s of silence; allow some slack on top.
const SILENCE_LIMIT: Duration = Duration::from_secs(45);

type EventSubWs = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// --- Wire format --------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct Metadata {
    message_id: String,
    message_type: String,
}

#[derive(Deserialize)]
struct RewardRef {
    id: String,
}

#[derive(Deserialize)]
struct RedemptionEvent {
    id: String,
    #[serde(default)]
    user_login: String,
    #[serde(default)]
    user_input: String,
    reward: RewardRef,
    #[serde(default)]
    redeemed_at: Option<String>,
}

#[derive(Deserialize)]
struct LockEventOutcome {
    id: String,
    #[serde(default)]
    users: u64,
    #[serde(default)]
    channel_points: u64,
}

#[derive(Deserialize)]
struct LockEvent {
    id: String,
    #[serde(default)]
    outcomes: Vec<LockEventOutcome>,
}

/// A decoded EventSub websocket message.
#[derive(Debug)]
pub enum Inbound {
    Welcome { session_id: String },
    Keepalive,
    Notification(EngineEvent),
    Reconnect { url: String },
    Revocation { subscription_type: String },
    /// A notification for a subscription type we do not handle.
    Ignored(String),
}

fn str_at<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |v, key| v.get(key))?.as_str()
}

fn decode_notification(payload: &Value) -> anyhow::Result<Inbound> {
    let kind = str_at(payload, &["subscription", "type"]).context("notification without subscription type")?;
    let event = payload.get("event").cloned().context("notification without event")?;

    match kind {
        REDEMPTION_ADD => {
            let ev: RedemptionEvent = serde_json::from_value(event).context("redemption event")?;
            let redeemed_at = ev
                .redeemed_at
                .as_deref()
                .and_then(|s| OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok());
            Ok(Inbound::Notification(EngineEvent::Redemption(Redemption {
                id: ev.id,
                reward_id: ev.reward.id,
                user_input: ev.user_input,
                user_login: ev.user_login,
                redeemed_at,
            })))
        }
        PREDICTION_LOCK => {
            let ev: LockEvent = serde_json::from_value(event).context("prediction lock event")?;
            Ok(Inbound::Notification(EngineEvent::PredictionLocked(PredictionLock {
                vote_id: ev.id,
                outcomes: ev
                    .outcomes
                    .into_iter()
                    .map(|o| LockOutcome {
                        id: o.id,
                        channel_points: o.channel_points,
                        users: o.users,
                    })
                    .collect(),
            })))
        }
        other => Ok(Inbound::Ignored(other.to_string())),
    }
}

pub fn decode(text: &str) -> anyhow::Result<Inbound> {
    let env: Envelope = serde_json::from_str(text).context("eventsub envelope")?;
    debug!("eventsub {} ({})", env.metadata.message_type, env.metadata.message_id);

    match env.metadata.message_type.as_str() {
        "session_welcome" => {
            let session_id = str_at(&env.payload, &["session", "id"]).context("welcome without session id")?;
            Ok(Inbound::Welcome {
                session_id: session_id.to_string(),
            })
        }
        "session_keepalive" => Ok(Inbound::Keepalive),
        "session_reconnect" => {
            let url = str_at(&env.payload, &["session", "reconnect_url"]).context("reconnect without url")?;
            Ok(Inbound::Reconnect { url: url.to_string() })
        }
        "notification" => decode_notification(&env.payload),
        "revocation" => Ok(Inbound::Revocation {
            subscription_type: str_at(&env.payload, &["subscription", "type"])
                .unwrap_or("unknown")
                .to_string(),
        }),
        other => Ok(Inbound::Ignored(other.to_string())),
    }
}

// --- Transport ----------------------------------------------------------------

/// Keeps one EventSub session alive and forwards notifications to the engine.
pub struct EventSubTransport {
    url: String,
    helix: HelixClient,
    reward_ids: Vec<String>,
    events: EventTx,
}

async fn connect(url: &str) -> anyhow::Result<EventSubWs> {
    let url = Url::parse(url).with_context(|| format!("invalid eventsub url {url}"))?;
    let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .context("connect_async to eventsub ws")?;
    Ok(ws)
}

/// Read the next text frame. Control frames are handled by tungstenite.
async fn next_text<T>(ws: &mut WebSocketStream<T>) -> anyhow::Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(frame))) => anyhow::bail!("eventsub socket closed: {frame:?}"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("eventsub read"),
            None => anyhow::bail!("eventsub socket ended"),
        }
    }
}

/// Everything except session control: notifications go to the engine, the
/// rest is logged.
fn forward(inbound: Inbound, events: &EventTx) -> anyhow::Result<()> {
    match inbound {
        Inbound::Notification(ev) => events.send(ev).context("engine stopped")?,
        Inbound::Keepalive => {}
        Inbound::Revocation { subscription_type } => {
            warn!("eventsub revoked subscription {subscription_type}");
        }
        Inbound::Ignored(kind) => debug!("ignoring eventsub message {kind}"),
        Inbound::Welcome { session_id } => debug!("unexpected welcome for {session_id}"),
        Inbound::Reconnect { url } => debug!("ignoring reconnect to {url} while migrating"),
    }
    Ok(())
}

/// Reads one session until it fails, following `session_reconnect` onto the
/// sessions `connect` opens.
async fn pump<T, C, Fut>(
    mut ws: WebSocketStream<T>,
    mut connect: C,
    events: &EventTx,
    mut on_welcome: impl FnMut(&str),
) -> anyhow::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<WebSocketStream<T>>>,
{
    loop {
        let text = tokio::time::timeout(SILENCE_LIMIT, next_text(&mut ws))
            .await
            .context("eventsub went silent")??;
        match decode(&text) {
            Ok(Inbound::Welcome { session_id }) => on_welcome(&session_id),
            Ok(Inbound::Reconnect { url }) => {
                info!("eventsub asked us to reconnect");
                let fresh = tokio::time::timeout(SILENCE_LIMIT, handover(&mut ws, connect(url), events))
                    .await
                    .context("eventsub reconnect timed out")??;
                let mut old = std::mem::replace(&mut ws, fresh);
                if let Err(e) = old.close(None).await {
                    debug!("closing the old eventsub session failed: {e}");
                }
            }
            Ok(other) => forward(other, events)?,
            Err(e) => warn!("dropping malformed eventsub message: {e:#}"),
        }
    }
}

/// Waits for the new session's welcome while the old one keeps delivering.
/// Subscriptions carry over to the new session, so nothing is re-subscribed.
async fn handover<T, Fut>(
    old: &mut WebSocketStream<T>,
    connecting: Fut,
    events: &EventTx,
) -> anyhow::Result<WebSocketStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    Fut: Future<Output = anyhow::Result<WebSocketStream<T>>>,
{
    let welcomed = await_welcome(connecting);
    tokio::pin!(welcomed);
    let mut old_open = true;

    loop {
        tokio::select! {
            biased;
            text = next_text(old), if old_open => match text {
                Ok(text) => match decode(&text) {
                    Ok(inbound) => forward(inbound, events)?,
                    Err(e) => warn!("dropping malformed eventsub message: {e:#}"),
                },
                Err(e) => {
                    debug!("old eventsub session ended during reconnect: {e:#}");
                    old_open = false;
                }
            },
            fresh = &mut welcomed => return fresh,
        }
    }
}

async fn await_welcome<T, Fut>(connecting: Fut) -> anyhow::Result<WebSocketStream<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    Fut: Future<Output = anyhow::Result<WebSocketStream<T>>>,
{
    let mut ws = connecting.await?;
    loop {
        let text = next_text(&mut ws).await?;
        match decode(&text) {
            Ok(Inbound::Welcome { session_id }) => {
                info!("eventsub session migrated to {session_id}");
                return Ok(ws);
            }
            Ok(other) => debug!("eventsub message before welcome on new session: {other:?}"),
            Err(e) => warn!("dropping malformed eventsub message: {e:#}"),
        }
    }
}

async fn subscribe_all(helix: HelixClient, reward_ids: Vec<String>, session_id: String) {
    info!("eventsub session {session_id} ready; subscribing");
    let broadcaster = helix.broadcaster_id().to_string();

    for reward_id in &reward_ids {
        let condition = json!({ "broadcaster_user_id": broadcaster, "reward_id": reward_id });
        match helix.subscribe(REDEMPTION_ADD, condition, &session_id).await {
            Ok(id) => debug!("subscribed to redemptions for {reward_id} ({id})"),
            Err(e) => warn!("failed to subscribe to redemptions for {reward_id}: {e}"),
        }
    }

    let condition = json!({ "broadcaster_user_id": broadcaster });
    match helix.subscribe(PREDICTION_LOCK, condition, &session_id).await {
        Ok(id) => debug!("subscribed to prediction locks ({id})"),
        Err(e) => warn!("failed to subscribe to prediction locks: {e}"),
    }
}

impl EventSubTransport {
    pub fn new(url: impl Into<String>, helix: HelixClient, reward_ids: Vec<String>, events: EventTx) -> Self {
        Self {
            url: url.into(),
            helix,
            reward_ids,
            events,
        }
    }

    /// Runs until the socket fails or the engine goes away.
    pub async fn run(self) -> anyhow::Result<()> {
        let ws = connect(&self.url).await?;
        info!("eventsub connected to {}", self.url);

        let Self {
            helix,
            reward_ids,
            events,
            ..
        } = self;
        let on_welcome = |session_id: &str| {
            tokio::spawn(subscribe_all(helix.clone(), reward_ids.clone(), session_id.to_string()));
        };
        pump(ws, |url: String| async move { connect(&url).await }, &events, on_welcome).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::SinkExt;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    fn welcome(session_id: &str) -> String {
        json!({
            "metadata": {"message_id": format!("w-{session_id}"), "message_type": "session_welcome"},
            "payload": {"session": {"id": session_id, "status": "connected"}}
        })
        .to_string()
    }

    fn reconnect(url: &str) -> String {
        json!({
            "metadata": {"message_id": "rc", "message_type": "session_reconnect"},
            "payload": {"session": {"id": "s1", "status": "reconnecting", "reconnect_url": url}}
        })
        .to_string()
    }

    fn redemption(id: &str) -> String {
        json!({
            "metadata": {"message_id": format!("n-{id}"), "message_type": "notification"},
            "payload": {
                "subscription": {"type": REDEMPTION_ADD},
                "event": {"id": id, "user_login": "viewer", "user_input": "song", "reward": {"id": "song-reward"}}
            }
        })
        .to_string()
    }

    /// An in-memory session: the client end for `pump`, the server end for the test.
    async fn session() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    async fn say(server: &mut WebSocketStream<DuplexStream>, text: String) {
        server.send(Message::Text(text)).await.unwrap();
    }

    fn redemption_id(ev: EngineEvent) -> String {
        match ev {
            EngineEvent::Redemption(r) => r.id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_keeps_delivering_from_the_old_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (old_client, mut old_server) = session().await;
        let (new_client, mut new_server) = session().await;

        say(&mut old_server, welcome("s1")).await;
        say(&mut old_server, reconnect("wss://eventsub.example/reconnect")).await;
        say(&mut old_server, redemption("r1")).await;
        say(&mut new_server, welcome("s2")).await;
        say(&mut new_server, redemption("r2")).await;
        new_server.close(None).await.unwrap();

        let slot = Mutex::new(Some(new_client));
        let dialed = Mutex::new(Vec::new());
        let connect = |url: String| {
            dialed.lock().unwrap().push(url);
            let ws = slot.lock().unwrap().take();
            async move { ws.context("no second session") }
        };
        let mut welcomed = Vec::new();

        let err = pump(old_client, connect, &tx, |id: &str| welcomed.push(id.to_string()))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("closed"), "{err:#}");

        // Only the first session subscribes; the second inherits its subscriptions.
        assert_eq!(welcomed, vec!["s1".to_string()]);
        assert_eq!(*dialed.lock().unwrap(), vec!["wss://eventsub.example/reconnect".to_string()]);
        assert_eq!(redemption_id(rx.try_recv().unwrap()), "r1");
        assert_eq!(redemption_id(rx.try_recv().unwrap()), "r2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_when_the_new_session_never_welcomes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (old_client, mut old_server) = session().await;
        let (new_client, _new_server) = session().await;

        say(&mut old_server, welcome("s1")).await;
        say(&mut old_server, reconnect("wss://eventsub.example/reconnect")).await;
        say(&mut old_server, redemption("r1")).await;

        let slot = Mutex::new(Some(new_client));
        let connect = |_url: String| {
            let ws = slot.lock().unwrap().take();
            async move { ws.context("no second session") }
        };

        let err = pump(old_client, connect, &tx, |_: &str| {}).await.unwrap_err();
        assert!(format!("{err:#}").contains("reconnect timed out"), "{err:#}");
        assert_eq!(redemption_id(rx.try_recv().unwrap()), "r1");
    }

    #[test]
    fn welcome_carries_session_id() {
        let raw = r#"{
            "metadata": {"message_id": "m1", "message_type": "session_welcome", "message_timestamp": "2023-07-19T14:56:51.634234626Z"},
            "payload": {"session": {"id": "AQoQexAWVYKSTIu4ec_2VAxyuhAB", "status": "connected", "keepalive_timeout_seconds": 30, "reconnect_url": null}}
        }"#;
        match decode(raw).unwrap() {
            Inbound::Welcome { session_id } => assert_eq!(session_id, "AQoQexAWVYKSTIu4ec_2VAxyuhAB"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keepalive_and_reconnect() {
        let keepalive = r#"{"metadata": {"message_id": "m2", "message_type": "session_keepalive"}, "payload": {}}"#;
        assert!(matches!(decode(keepalive).unwrap(), Inbound::Keepalive));

        let reconnect = r#"{
            "metadata": {"message_id": "m3", "message_type": "session_reconnect"},
            "payload": {"session": {"id": "s1", "status": "reconnecting", "reconnect_url": "wss://eventsub.wss.twitch.tv?reconnect=abc"}}
        }"#;
        match decode(reconnect).unwrap() {
            Inbound::Reconnect { url } => assert_eq!(url, "wss://eventsub.wss.twitch.tv?reconnect=abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn redemption_notification() {
        let raw = r#"{
            "metadata": {"message_id": "m4", "message_type": "notification", "subscription_type": "channel.channel_points_custom_reward_redemption.add"},
            "payload": {
                "subscription": {"id": "sub1", "type": "channel.channel_points_custom_reward_redemption.add"},
                "event": {
                    "id": "17fa2df1-ad76-4804-bfa5-a40ef63efe63",
                    "broadcaster_user_id": "1337",
                    "user_login": "cool_user",
                    "user_input": "never gonna give you up",
                    "status": "fulfilled",
                    "reward": {"id": "92af127c-7326-4483-a52b-b0da0be61c01", "title": "Add a song request", "cost": 10, "prompt": ""},
                    "redeemed_at": "2020-07-15T17:16:03.17106713Z"
                }
            }
        }"#;
        match decode(raw).unwrap() {
            Inbound::Notification(EngineEvent::Redemption(r)) => {
                assert_eq!(r.id, "17fa2df1-ad76-4804-bfa5-a40ef63efe63");
                assert_eq!(r.reward_id, "92af127c-7326-4483-a52b-b0da0be61c01");
                assert_eq!(r.user_input, "never gonna give you up");
                assert_eq!(r.user_login, "cool_user");
                assert_eq!(r.redeemed_at.map(|t| t.year()), Some(2020));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prediction_lock_notification() {
        let raw = r#"{
            "metadata": {"message_id": "m5", "message_type": "notification"},
            "payload": {
                "subscription": {"id": "sub2", "type": "channel.prediction.lock"},
                "event": {
                    "id": "1243456",
                    "title": "Vote on the next song!",
                    "outcomes": [
                        {"id": "o1", "title": "A", "color": "blue", "users": 3, "channel_points": 5},
                        {"id": "o2", "title": "B", "color": "pink"}
                    ]
                }
            }
        }"#;
        match decode(raw).unwrap() {
            Inbound::Notification(EngineEvent::PredictionLocked(lock)) => {
                assert_eq!(lock.vote_id, "1243456");
                assert_eq!(lock.outcomes.len(), 2);
                assert_eq!(lock.outcomes[0], LockOutcome { id: "o1".into(), channel_points: 5, users: 3 });
                assert_eq!(lock.outcomes[1].channel_points, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_subscription_types_are_ignored() {
        let raw = r#"{
            "metadata": {"message_id": "m6", "message_type": "notification"},
            "payload": {"subscription": {"type": "channel.follow"}, "event": {}}
        }"#;
        assert!(matches!(decode(raw).unwrap(), Inbound::Ignored(kind) if kind == "channel.follow"));
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(decode("not json").is_err());
        let missing_event = r#"{
            "metadata": {"message_id": "m7", "message_type": "notification"},
            "payload": {"subscription": {"type": "channel.prediction.lock"}}
        }"#;
        assert!(decode(missing_event).is_err());
        let bad_redemption = r#"{
            "metadata": {"message_id": "m8", "message_type": "notification"},
            "payload": {"subscription": {"type": "channel.channel_points_custom_reward_redemption.add"}, "event": {"id": "x"}}
        }"#;
        assert!(decode(bad_redemption).is_err());
    }

    #[test]
    fn revocation_names_the_subscription() {
        let raw = r#"{
            "metadata": {"message_id": "m9", "message_type": "revocation"},
            "payload": {"subscription": {"type": "channel.prediction.lock", "status": "authorization_revoked"}}
        }"#;
        assert!(matches!(
            decode(raw).unwrap(),
            Inbound::Revocation { subscription_type } if subscription_type == "channel.prediction.lock"
        ));
    }
}
