use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::error::ApiResult;
use crate::platform::{OpenedVote, VideoInfo};
use crate::playback::WidgetReport;

/// A viewer redeemed one of our rewards.
#[derive(Clone, Debug)]
pub struct Redemption {
    pub id: String,
    pub reward_id: String,
    pub user_input: String,
    pub user_login: String,
    pub redeemed_at: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LockOutcome {
    pub id: String,
    pub channel_points: u64,
    pub users: u64,
}

/// The platform stopped accepting votes on a prediction.
#[derive(Clone, Debug)]
pub struct PredictionLock {
    pub vote_id: String,
    pub outcomes: Vec<LockOutcome>,
}

/// Everything the engine task reacts to. Handlers run one at a time, in
/// arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    Redemption(Redemption),
    PredictionLocked(PredictionLock),
    Widget(WidgetReport),
    /// Operator skip from the HTTP surface.
    Skip,
    /// A scheduled round's timer elapsed.
    ActivatePrediction { seq: u64 },
    /// The vote platform answered a create request for round `seq`.
    PredictionOpened { seq: u64, result: ApiResult<OpenedVote> },
    LookupFinished { redemption: Redemption, result: ApiResult<Vec<VideoInfo>> },
}

pub type EventTx = mpsc::UnboundedSender<EngineEvent>;
pub type EventRx = mpsc::UnboundedReceiver<EngineEvent>;
