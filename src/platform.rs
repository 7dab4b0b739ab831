// --- Collaborator seams -------------------------------------------------------
//
// The engine talks to three outside parties: a video catalogue, a vote
// platform and the playback widget. Each sits behind a trait so the engine can
// run against fakes in tests.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ApiResult;

/// Metadata for one resolvable video.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    /// `None` for live broadcasts.
    pub duration_secs: Option<u32>,
    pub view_count: u64,
    pub is_live: bool,
}

impl VideoInfo {
    pub fn is_valid(&self, min_views: u64, allow_live: bool) -> bool {
        self.view_count > min_views && (allow_live || !self.is_live)
    }
}

#[async_trait]
pub trait VideoLookup: Send + Sync {
    /// Resolve free text, a video id or a video URL. Results are ordered by
    /// relevance.
    async fn resolve(&self, query: &str) -> ApiResult<Vec<VideoInfo>>;
}

/// A vote the platform accepted; `outcome_ids` is in the order the labels
/// were submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct OpenedVote {
    pub vote_id: String,
    pub outcome_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteClose {
    Resolved(String),
    Canceled,
}

#[async_trait]
pub trait VotePlatform: Send + Sync {
    async fn create_vote(&self, title: &str, labels: &[String], window_secs: u32) -> ApiResult<OpenedVote>;
    async fn close_vote(&self, vote_id: &str, close: VoteClose) -> ApiResult<()>;
}

/// Commands for the playback widget. The widget answers with state
/// notifications, never with return values.
pub trait Player: Send + Sync {
    /// Returns false when no widget was there to take the command.
    fn load(&self, video_id: &str) -> bool;
    fn play(&self);
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(views: u64, live: bool) -> VideoInfo {
        VideoInfo {
            id: "v".into(),
            title: "t".into(),
            duration_secs: if live { None } else { Some(200) },
            view_count: views,
            is_live: live,
        }
    }

    #[test]
    fn validity_needs_views_above_threshold() {
        assert!(!info(1000, false).is_valid(1000, false));
        assert!(info(1001, false).is_valid(1000, false));
    }

    #[test]
    fn live_needs_opt_in() {
        assert!(!info(5000, true).is_valid(1000, false));
        assert!(info(5000, true).is_valid(1000, true));
    }
}
