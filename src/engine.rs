use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventRx, EventTx, Redemption};
use crate::platform::{Player, VideoLookup, VotePlatform};
use crate::playback::{LoadedItem, PlaybackState};
use crate::prediction::{PredictionScheduler, RoundView};
use crate::queue::{VideoQueue, VideoRequest};
use crate::router::{RedemptionKind, RedemptionRouter};

// --- Engine -----------------------------------------------------------------
//
// One task owns the whole `Station`. Poll ticks, transport notifications,
// widget reports, operator commands and the replies of spawned external calls
// all arrive as `EngineEvent`s and are handled strictly one after another, so
// nothing here needs a lock.

/// All mutable state of the request line.
pub struct Station {
    pub queue: VideoQueue,
    pub playback: PlaybackState,
    pub scheduler: PredictionScheduler,
    pub router: RedemptionRouter,
}

/// The outside parties the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub lookup: Arc<dyn VideoLookup>,
    pub votes: Arc<dyn VotePlatform>,
    pub player: Arc<dyn Player>,
}

#[derive(Clone, Debug, Serialize)]
pub struct NowPlaying {
    pub video_id: String,
    pub title: String,
    pub duration: Option<f64>,
    pub elapsed: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub is_playing: bool,
    pub is_live_broadcast: bool,
    pub now: Option<NowPlaying>,
    pub queue: Vec<VideoRequest>,
    pub prediction: RoundView,
}

pub struct Engine {
    station: Station,
    deps: Collaborators,
    cfg: EngineConfig,
    tx: EventTx,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl Engine {
    pub fn new(cfg: EngineConfig, deps: Collaborators) -> (Self, EventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let station = Station {
            queue: VideoQueue::new(),
            playback: PlaybackState::new(),
            scheduler: PredictionScheduler::new(),
            router: RedemptionRouter::new(cfg.song_reward_id.clone(), cfg.skip_reward_id.clone()),
        };
        let initial = snapshot(&station, Instant::now());
        let (status_tx, _) = watch::channel(initial);
        (
            Self {
                station,
                deps,
                cfg,
                tx,
                status_tx,
            },
            rx,
        )
    }

    pub fn sender(&self) -> EventTx {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub async fn run(mut self, mut rx: EventRx) {
        let mut interval = tokio::time::interval(self.cfg.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("engine running (poll every {:?})", self.cfg.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(Instant::now()),
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle(ev, Instant::now()),
                    None => break,
                },
            }
            self.publish(Instant::now());
        }
        warn!("engine event channel closed");
    }

    fn publish(&self, now: Instant) {
        self.status_tx.send_replace(snapshot(&self.station, now));
    }

    pub fn handle(&mut self, ev: EngineEvent, now: Instant) {
        match ev {
            EngineEvent::Redemption(r) => self.on_redemption(r, now),
            EngineEvent::PredictionLocked(lock) => {
                let st = &mut self.station;
                st.scheduler.resolve(&lock, &mut st.queue, &self.deps.votes);
            }
            EngineEvent::Widget(report) => {
                self.station.playback.apply(&report, now);
            }
            EngineEvent::Skip => self.skip(now),
            EngineEvent::ActivatePrediction { seq } => {
                let st = &mut self.station;
                st.scheduler
                    .activate(seq, &st.queue, &st.playback, &self.cfg, &self.deps.votes, &self.tx, now);
            }
            EngineEvent::PredictionOpened { seq, result } => {
                let st = &mut self.station;
                st.scheduler.on_opened(seq, result, &mut st.queue, &self.deps.votes);
            }
            EngineEvent::LookupFinished { redemption, result } => {
                if let Some(req) = self.station.router.lookup_finished(redemption, result, &self.cfg) {
                    self.enqueue(req);
                }
            }
        }
    }

    /// One poll-loop iteration.
    pub fn tick(&mut self, now: Instant) {
        let st = &mut self.station;
        st.scheduler.expire_stale(&mut st.queue, &self.deps.votes, &self.cfg, now);

        if st.playback.is_idle(now, self.cfg.load_grace) {
            if !st.queue.is_empty() && !st.scheduler.is_active() {
                self.dispatch_next(now);
            }
        } else if st.playback.is_playing() {
            st.scheduler.poll(&st.queue, &st.playback, &self.cfg, &self.tx, now);
        }
    }

    fn on_redemption(&mut self, r: Redemption, now: Instant) {
        match self.station.router.classify(&r.reward_id) {
            RedemptionKind::SongRequest => {
                info!("song request {} from {}: {:?}", r.id, r.user_login, r.user_input);
                if let Some(req) = self
                    .station
                    .router
                    .song_request(r, &self.deps.lookup, &self.tx, &self.cfg)
                {
                    self.enqueue(req);
                }
            }
            RedemptionKind::SkipSong => {
                info!("skip redeemed by {}", r.user_login);
                self.skip(now);
            }
            RedemptionKind::Unknown => debug!("ignoring redemption for reward {}", r.reward_id),
        }
    }

    fn enqueue(&mut self, req: VideoRequest) {
        let (id, title) = (req.id.clone(), req.title.clone());
        if self.station.queue.insert(req) {
            info!("queued {title:?} ({id}), {} waiting", self.station.queue.len());
        } else {
            debug!("request {id} already queued");
        }
    }

    /// Skip the current video: drop any prediction round, then play the next
    /// entry or stop.
    pub fn skip(&mut self, now: Instant) {
        if !self.station.playback.is_playing() {
            debug!("skip ignored: nothing playing");
            return;
        }
        let st = &mut self.station;
        st.scheduler.cancel(&mut st.queue, &self.deps.votes);

        if st.queue.is_empty() {
            info!("skip: queue empty, stopping playback");
            self.deps.player.stop();
        } else {
            self.dispatch_next(now);
        }
    }

    fn dispatch_next(&mut self, now: Instant) -> bool {
        let st = &mut self.station;
        let Some(next) = st.queue.peek_next().cloned() else {
            return false;
        };

        // Entries stay queued until a widget actually takes them.
        if !self.deps.player.load(&next.video_id) {
            debug!("no playback widget connected; holding {}", next.id);
            return false;
        }
        info!(
            "playing {:?} ({}) requested by {}{}",
            next.title,
            next.video_id,
            next.requested_by,
            if next.forced_next { " [vote winner]" } else { "" }
        );
        self.deps.player.play();
        st.playback.on_loaded(
            LoadedItem {
                video_id: next.video_id.clone(),
                title: next.title.clone(),
            },
            next.is_live(),
            next.duration_secs,
            now,
        );
        st.queue.remove(&next.id);
        true
    }
}

fn snapshot(st: &Station, now: Instant) -> StatusSnapshot {
    StatusSnapshot {
        is_playing: st.playback.is_playing(),
        is_live_broadcast: st.playback.is_live_broadcast(),
        now: st.playback.loaded().map(|item| NowPlaying {
            video_id: item.video_id.clone(),
            title: item.title.clone(),
            duration: st.playback.duration(),
            elapsed: st.playback.elapsed(now),
        }),
        queue: st.queue.entries().to_vec(),
        prediction: st.scheduler.view(now),
    }
}
