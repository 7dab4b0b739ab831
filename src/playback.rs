use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// State notifications emitted by the playback widget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetState {
    Playing,
    Ended,
    Stopped,
    Cued,
    Paused,
    Buffering,
}

/// One report from the widget: an optional state change plus the position it
/// observed when sending it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct WidgetReport {
    /// The video the widget had loaded when it sent this report.
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub state: Option<WidgetState>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub elapsed: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadedItem {
    pub video_id: String,
    pub title: String,
}

/// What the engine knows about the widget.
///
/// Only widget notifications flip `is_playing`; dispatching a video merely
/// marks a load as pending until the widget confirms it.
#[derive(Debug, Default)]
pub struct PlaybackState {
    is_playing: bool,
    /// Paused keeps `is_playing` set but freezes the position.
    is_paused: bool,
    is_live_broadcast: bool,
    loaded: Option<LoadedItem>,
    load_pending_since: Option<Instant>,
    duration: Option<f64>,
    elapsed: f64,
    reported_at: Option<Instant>,
}

impl PlaybackState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn is_live_broadcast(&self) -> bool {
        self.is_live_broadcast
    }

    pub fn loaded(&self) -> Option<&LoadedItem> {
        self.loaded.as_ref()
    }

    /// A video was handed to the widget. `metadata_duration` is used until the
    /// widget reports its own duration.
    pub fn on_loaded(&mut self, item: LoadedItem, is_live: bool, metadata_duration: Option<u32>, now: Instant) {
        self.is_live_broadcast = is_live;
        self.loaded = Some(item);
        self.load_pending_since = Some(now);
        self.duration = metadata_duration.map(f64::from);
        self.elapsed = 0.0;
        self.reported_at = None;
        self.is_paused = false;
    }

    pub fn on_started(&mut self, now: Instant) {
        if !self.is_playing || self.is_paused || self.reported_at.is_none() {
            self.reported_at = Some(now);
        }
        self.is_playing = true;
        self.is_paused = false;
        self.load_pending_since = None;
    }

    pub fn on_paused(&mut self, now: Instant) {
        if self.is_playing && !self.is_paused {
            self.elapsed = self.elapsed(now);
            self.reported_at = Some(now);
            self.is_paused = true;
        }
    }

    pub fn on_ended(&mut self, now: Instant) {
        self.halt(now);
    }

    pub fn on_stopped(&mut self, now: Instant) {
        self.halt(now);
    }

    pub fn on_cued(&mut self, now: Instant) {
        self.halt(now);
    }

    fn halt(&mut self, now: Instant) {
        self.elapsed = self.elapsed(now);
        self.reported_at = Some(now);
        self.is_playing = false;
        self.is_paused = false;
        self.load_pending_since = None;
    }

    pub fn on_progress(&mut self, duration: Option<f64>, elapsed: Option<f64>, now: Instant) {
        if let Some(d) = duration.filter(|d| d.is_finite() && *d > 0.0) {
            self.duration = Some(d);
        }
        if let Some(e) = elapsed.filter(|e| e.is_finite() && *e >= 0.0) {
            self.elapsed = e;
            self.reported_at = Some(now);
        }
    }

    /// Apply one widget report. Position first, so a state change carried in
    /// the same report anchors on the fresh position. Reports about a video
    /// other than the loaded one are dropped; returns whether it was applied.
    pub fn apply(&mut self, report: &WidgetReport, now: Instant) -> bool {
        if let (Some(reported), Some(item)) = (report.video_id.as_deref(), self.loaded.as_ref()) {
            if reported != item.video_id {
                debug!("dropping widget report for {reported}; {} is loaded", item.video_id);
                return false;
            }
        }
        self.on_progress(report.duration, report.elapsed, now);
        match report.state {
            Some(WidgetState::Playing) => self.on_started(now),
            Some(WidgetState::Ended) => self.on_ended(now),
            Some(WidgetState::Stopped) => self.on_stopped(now),
            Some(WidgetState::Cued) => self.on_cued(now),
            Some(WidgetState::Paused) => self.on_paused(now),
            Some(WidgetState::Buffering) | None => {}
        }
        true
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Elapsed seconds, extrapolated from the last report while playing.
    pub fn elapsed(&self, now: Instant) -> f64 {
        let mut pos = self.elapsed;
        if self.is_playing && !self.is_paused {
            if let Some(at) = self.reported_at {
                pos += now.saturating_duration_since(at).as_secs_f64();
            }
        }
        match self.duration {
            Some(d) => pos.min(d),
            None => pos,
        }
    }

    pub fn remaining(&self, now: Instant) -> Option<f64> {
        let d = self.duration?;
        Some((d - self.elapsed(now)).max(0.0))
    }

    /// True when nothing is playing and no recent dispatch is still waiting for
    /// the widget to start it.
    pub fn is_idle(&self, now: Instant, load_grace: Duration) -> bool {
        if self.is_playing {
            return false;
        }
        match self.load_pending_since {
            Some(since) => now.saturating_duration_since(since) >= load_grace,
            None => true,
        }
    }
}
