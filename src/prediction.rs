use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, MAX_OUTCOME_LABEL_CHARS, PREDICTION_TITLE};
use crate::error::ApiResult;
use crate::events::{EngineEvent, EventTx, LockOutcome, PredictionLock};
use crate::platform::{OpenedVote, VoteClose, VotePlatform};
use crate::playback::PlaybackState;
use crate::queue::VideoQueue;

// --- Prediction scheduling --------------------------------------------------
//
// Lifecycle: Idle -> Scheduled -> Active -> Idle, with cancel edges from both
// Scheduled and Active straight back to Idle. Every round gets a fresh
// sequence number; timer fires and vote-creation replies carry it, and
// anything tagged with a sequence that is no longer current is dropped.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Idle,
    Scheduled,
    Active,
}

#[derive(Clone, Debug, Serialize)]
pub struct Candidate {
    pub request_id: String,
    pub title: String,
    pub outcome_id: Option<String>,
}

enum Round {
    Idle,
    Scheduled {
        seq: u64,
        due: Instant,
        timer: JoinHandle<()>,
    },
    Active {
        seq: u64,
        /// `None` until the platform confirms creation.
        vote_id: Option<String>,
        candidates: Vec<Candidate>,
        opened_at: Instant,
    },
}

/// Read-only view for the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct RoundView {
    pub status: RoundStatus,
    pub seq: Option<u64>,
    pub vote_id: Option<String>,
    pub starts_in_secs: Option<f64>,
    pub candidates: Vec<Candidate>,
}

/// Lead time before a vote should open, or `None` if there is not enough
/// known playback ahead this tick.
///
/// `remaining` is what is left of the current item; `upcoming` yields queued
/// durations in insertion order (`None` for live items). A vote must end
/// exactly when the covered playback ends, so the lead is always
/// `covered - window`. When the current item alone is too short, queued items
/// are borrowed one by one, but only while at least two entries would still
/// be left after the borrowed ones.
pub fn plan_lead<I>(remaining: f64, upcoming: I, window: f64) -> Option<Duration>
where
    I: IntoIterator<Item = Option<u32>>,
{
    if remaining > window {
        return Some(Duration::from_secs_f64(remaining - window));
    }

    let upcoming: Vec<Option<u32>> = upcoming.into_iter().collect();
    let mut covered = remaining;
    for (i, dur) in upcoming.iter().enumerate() {
        // Live items have no end to borrow against.
        let dur = (*dur)?;
        covered += f64::from(dur);
        let left_after = upcoming.len() - i - 1;
        if covered > window && left_after >= 2 {
            return Some(Duration::from_secs_f64(covered - window));
        }
    }
    None
}

/// Highest channel-point total wins; voter count breaks ties. Exact ties on
/// both keep whichever outcome is listed first.
pub fn pick_winner(outcomes: &[LockOutcome]) -> Option<&LockOutcome> {
    let mut best: Option<&LockOutcome> = None;
    for o in outcomes {
        match best {
            Some(b) if (o.channel_points, o.users) <= (b.channel_points, b.users) => {}
            _ => best = Some(o),
        }
    }
    best
}

pub fn outcome_label(title: &str) -> String {
    title.chars().take(MAX_OUTCOME_LABEL_CHARS).collect()
}

fn close_in_background(votes: &Arc<dyn VotePlatform>, vote_id: String, close: VoteClose) {
    let votes = votes.clone();
    tokio::spawn(async move {
        if let Err(e) = votes.close_vote(&vote_id, close.clone()).await {
            warn!("failed to close prediction {vote_id} ({close:?}): {e}");
        }
    });
}

pub struct PredictionScheduler {
    round: Round,
    next_seq: u64,
    rng: fastrand::Rng,
}

impl Default for PredictionScheduler {
    fn default() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }
}

impl PredictionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rng(rng: fastrand::Rng) -> Self {
        Self { round: Round::Idle, next_seq: 0, rng }
    }

    pub fn status(&self) -> RoundStatus {
        match self.round {
            Round::Idle => RoundStatus::Idle,
            Round::Scheduled { .. } => RoundStatus::Scheduled,
            Round::Active { .. } => RoundStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.round, Round::Active { .. })
    }

    pub fn vote_id(&self) -> Option<&str> {
        match &self.round {
            Round::Active { vote_id, .. } => vote_id.as_deref(),
            _ => None,
        }
    }

    pub fn view(&self, now: Instant) -> RoundView {
        match &self.round {
            Round::Idle => RoundView {
                status: self.status(),
                seq: None,
                vote_id: None,
                starts_in_secs: None,
                candidates: Vec::new(),
            },
            Round::Scheduled { seq, due, .. } => RoundView {
                status: self.status(),
                seq: Some(*seq),
                vote_id: None,
                starts_in_secs: Some(due.saturating_duration_since(now).as_secs_f64()),
                candidates: Vec::new(),
            },
            Round::Active { seq, vote_id, candidates, .. } => RoundView {
                status: self.status(),
                seq: Some(*seq),
                vote_id: vote_id.clone(),
                starts_in_secs: None,
                candidates: candidates.clone(),
            },
        }
    }

    /// Conditions that must hold before a new round may be scheduled, apart
    /// from the timing check.
    pub fn can_schedule(&self, queue: &VideoQueue, playback: &PlaybackState) -> bool {
        matches!(self.round, Round::Idle) && Self::conditions_hold(queue, playback)
    }

    fn conditions_hold(queue: &VideoQueue, playback: &PlaybackState) -> bool {
        queue.len() >= 2
            && !queue.has_forced_next()
            && playback.is_playing()
            && !playback.is_live_broadcast()
    }

    /// Poll-tick entry point. Schedules a round when eligible and there is
    /// enough lead time; returns the lead if it did.
    pub fn poll(
        &mut self,
        queue: &VideoQueue,
        playback: &PlaybackState,
        cfg: &EngineConfig,
        tx: &EventTx,
        now: Instant,
    ) -> Option<Duration> {
        if !self.can_schedule(queue, playback) {
            return None;
        }
        let remaining = playback.remaining(now)?;
        let lead = plan_lead(
            remaining,
            queue.entries().iter().map(|e| e.duration_secs),
            f64::from(cfg.window_secs),
        )?;
        self.schedule(lead, tx, now);
        Some(lead)
    }

    fn schedule(&mut self, lead: Duration, tx: &EventTx, now: Instant) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(lead).await;
            let _ = tx.send(EngineEvent::ActivatePrediction { seq });
        });
        info!("prediction {seq} starting in {:.1}s", lead.as_secs_f64());
        self.round = Round::Scheduled { seq, due: now + lead, timer };
    }

    /// The timer for round `seq` fired. Re-checks everything, samples the
    /// candidates and asks the platform to open the vote.
    pub fn activate(
        &mut self,
        seq: u64,
        queue: &VideoQueue,
        playback: &PlaybackState,
        cfg: &EngineConfig,
        votes: &Arc<dyn VotePlatform>,
        tx: &EventTx,
        now: Instant,
    ) {
        match &self.round {
            Round::Scheduled { seq: current, .. } if *current == seq => {}
            _ => {
                debug!("ignoring activation for superseded prediction {seq}");
                return;
            }
        }
        self.round = Round::Idle;

        if !Self::conditions_hold(queue, playback) {
            info!("prediction {seq} aborted: conditions changed before activation");
            return;
        }

        let mut picks: Vec<_> = queue.entries().iter().collect();
        self.rng.shuffle(&mut picks);
        picks.truncate(cfg.max_candidates);
        if picks.len() < 2 {
            info!("prediction {seq} aborted: not enough entries");
            return;
        }

        let candidates: Vec<Candidate> = picks
            .iter()
            .map(|e| Candidate {
                request_id: e.id.clone(),
                title: e.title.clone(),
                outcome_id: None,
            })
            .collect();
        let labels: Vec<String> = candidates.iter().map(|c| outcome_label(&c.title)).collect();
        let window = cfg.window_secs.saturating_sub(cfg.safety_margin_secs);

        let votes = votes.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = votes.create_vote(PREDICTION_TITLE, &labels, window).await;
            let _ = tx.send(EngineEvent::PredictionOpened { seq, result });
        });

        info!("prediction {seq} opening with {} candidates", candidates.len());
        self.round = Round::Active {
            seq,
            vote_id: None,
            candidates,
            opened_at: now,
        };
    }

    /// The platform answered the create request for round `seq`.
    pub fn on_opened(
        &mut self,
        seq: u64,
        result: ApiResult<OpenedVote>,
        queue: &mut VideoQueue,
        votes: &Arc<dyn VotePlatform>,
    ) {
        let current = matches!(
            &self.round,
            Round::Active { seq: s, vote_id: None, .. } if *s == seq
        );

        if !current {
            // Canceled while the request was in flight; don't leave the vote
            // running on the platform.
            if let Ok(opened) = result {
                info!("closing prediction {} opened for superseded round {seq}", opened.vote_id);
                close_in_background(votes, opened.vote_id, VoteClose::Canceled);
            }
            return;
        }

        let opened = match result {
            Ok(opened) => opened,
            Err(e) => {
                warn!("failed to create prediction {seq}: {e}");
                self.round = Round::Idle;
                return;
            }
        };

        if let Round::Active { vote_id, candidates, .. } = &mut self.round {
            if opened.outcome_ids.len() != candidates.len() {
                warn!(
                    "prediction {} returned {} outcomes for {} candidates",
                    opened.vote_id,
                    opened.outcome_ids.len(),
                    candidates.len()
                );
            }
            for (c, outcome_id) in candidates.iter_mut().zip(&opened.outcome_ids) {
                c.outcome_id = Some(outcome_id.clone());
                queue.assign_outcome(&c.request_id, outcome_id);
            }
            info!("prediction {seq} is live as {}", opened.vote_id);
            *vote_id = Some(opened.vote_id);
        }
    }

    /// Apply a lock notification. Returns the request id forced to play next,
    /// if any.
    pub fn resolve(
        &mut self,
        lock: &PredictionLock,
        queue: &mut VideoQueue,
        votes: &Arc<dyn VotePlatform>,
    ) -> Option<String> {
        if self.vote_id() != Some(lock.vote_id.as_str()) {
            debug!("ignoring lock for unknown prediction {}", lock.vote_id);
            return None;
        }
        self.round = Round::Idle;

        let winner = pick_winner(&lock.outcomes).filter(|w| w.channel_points > 0);
        let forced = match winner {
            None => {
                info!("prediction {} had no votes; canceling", lock.vote_id);
                close_in_background(votes, lock.vote_id.clone(), VoteClose::Canceled);
                None
            }
            Some(w) => {
                let entry = queue.find_by_outcome(&w.id).map(|e| e.id.clone());
                match &entry {
                    Some(id) => {
                        queue.mark_forced_next(id);
                        info!("prediction {} won by request {id}", lock.vote_id);
                    }
                    None => warn!("winning outcome {} no longer matches a queued request", w.id),
                }
                close_in_background(votes, lock.vote_id.clone(), VoteClose::Resolved(w.id.clone()));
                entry
            }
        };

        queue.clear_outcomes();
        forced
    }

    /// Drop any scheduled or active round immediately.
    pub fn cancel(&mut self, queue: &mut VideoQueue, votes: &Arc<dyn VotePlatform>) {
        match std::mem::replace(&mut self.round, Round::Idle) {
            Round::Idle => return,
            Round::Scheduled { seq, timer, .. } => {
                timer.abort();
                info!("scheduled prediction {seq} canceled");
            }
            Round::Active { seq, vote_id, .. } => {
                info!("active prediction {seq} canceled");
                if let Some(id) = vote_id {
                    close_in_background(votes, id, VoteClose::Canceled);
                }
            }
        }
        queue.clear_outcomes();
    }

    /// Cancel an active round whose lock notification never showed up.
    pub fn expire_stale(
        &mut self,
        queue: &mut VideoQueue,
        votes: &Arc<dyn VotePlatform>,
        cfg: &EngineConfig,
        now: Instant,
    ) -> bool {
        let limit = Duration::from_secs(u64::from(cfg.window_secs)) + cfg.active_grace;
        let stale = matches!(
            &self.round,
            Round::Active { opened_at, .. } if now.saturating_duration_since(*opened_at) > limit
        );
        if stale {
            warn!("prediction lock never arrived; canceling round");
            self.cancel(queue, votes);
        }
        stale
    }
}
