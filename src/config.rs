use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

// --- Tunables ---------------------------------------------------------------

/// Length of a vote, and the lead the scheduler needs before the current
/// playback runs out.
pub const PREDICTION_WINDOW_SECS: u32 = 60;
/// Subtracted from the window handed to the platform so its own lock lands
/// before the track ends.
pub const PREDICTION_SAFETY_MARGIN_SECS: u32 = 2;
pub const MAX_PREDICTION_CANDIDATES: usize = 10;
pub const MAX_OUTCOME_LABEL_CHARS: usize = 25;
pub const MIN_VIEW_COUNT: u64 = 1000;
pub const PREDICTION_TITLE: &str = "Vote on the next song!";

pub const SONG_REWARD_TITLE: &str = "Add a song request";
pub const SONG_REWARD_PROMPT: &str = "Enter youtube id or title + artist name";
pub const SKIP_REWARD_TITLE: &str = "Skip Song";

const DEFAULT_EVENTSUB_URL: &str = "wss://eventsub.wss.twitch.tv/ws?keepalive_timeout_seconds=30";

/// Settings the engine task needs. Kept separate from [`Config`] so tests can
/// build one without touching the environment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub window_secs: u32,
    pub safety_margin_secs: u32,
    pub max_candidates: usize,
    pub min_view_count: u64,
    pub allow_live: bool,
    pub poll_interval: Duration,
    /// How long a dispatched video may take to report `playing` before the
    /// poll loop considers the widget idle again.
    pub load_grace: Duration,
    /// How long past its window an active vote may wait for the lock
    /// notification before it is canceled.
    pub active_grace: Duration,
    pub song_reward_id: String,
    pub skip_reward_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_secs: PREDICTION_WINDOW_SECS,
            safety_margin_secs: PREDICTION_SAFETY_MARGIN_SECS,
            max_candidates: MAX_PREDICTION_CANDIDATES,
            min_view_count: MIN_VIEW_COUNT,
            allow_live: false,
            poll_interval: Duration::from_millis(900),
            load_grace: Duration::from_secs(10),
            active_grace: Duration::from_secs(15),
            song_reward_id: String::new(),
            skip_reward_id: String::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RewardCosts {
    pub song: u32,
    pub skip: u32,
}

/// Process configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub twitch_client_id: String,
    pub twitch_token: String,
    pub broadcaster_id: String,
    pub youtube_api_keys: Vec<String>,
    pub eventsub_url: String,
    pub overlay_dir: String,
    pub costs: RewardCosts,
    /// Pre-existing reward ids. When both are set, reward provisioning is
    /// skipped.
    pub song_reward_id: Option<String>,
    pub skip_reward_id: Option<String>,
    pub engine: EngineConfig,
}

fn required(name: &str) -> anyhow::Result<String> {
    let v = std::env::var(name).with_context(|| format!("{name} must be set"))?;
    if v.trim().is_empty() {
        anyhow::bail!("{name} must not be empty");
    }
    Ok(v.trim().to_string())
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {name}={v}: {e}")),
        None => Ok(default),
    }
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind: SocketAddr = std::env::var("REQUESTLINE_BIND")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .context("invalid REQUESTLINE_BIND")?;

        let youtube_api_keys = split_keys(&required("YOUTUBE_API_KEYS")?);
        if youtube_api_keys.is_empty() {
            anyhow::bail!("YOUTUBE_API_KEYS must list at least one key");
        }

        let engine = EngineConfig {
            allow_live: parsed("REQUESTLINE_ALLOW_LIVE", false)?,
            poll_interval: Duration::from_millis(parsed("REQUESTLINE_POLL_MS", 900u64)?.max(100)),
            ..EngineConfig::default()
        };

        Ok(Self {
            bind,
            twitch_client_id: required("TWITCH_CLIENT_ID")?,
            twitch_token: required("TWITCH_OAUTH_TOKEN")?,
            broadcaster_id: required("BROADCASTER_USER_ID")?,
            youtube_api_keys,
            eventsub_url: optional("REQUESTLINE_EVENTSUB_URL").unwrap_or_else(|| DEFAULT_EVENTSUB_URL.to_string()),
            overlay_dir: optional("REQUESTLINE_OVERLAY_DIR").unwrap_or_else(|| "overlay".to_string()),
            costs: RewardCosts {
                song: parsed("REQUESTLINE_SONG_COST", 10u32)?,
                skip: parsed("REQUESTLINE_SKIP_COST", 5000u32)?,
            },
            song_reward_id: optional("REQUESTLINE_SONG_REWARD_ID"),
            skip_reward_id: optional("REQUESTLINE_SKIP_REWARD_ID"),
            engine,
        })
    }
}
