//! Fakes for the collaborator traits, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ApiError, ApiResult};
use crate::platform::{OpenedVote, Player, VideoInfo, VideoLookup, VoteClose, VotePlatform};
use crate::queue::VideoRequest;

/// Let spawned fire-and-forget tasks run to completion.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn request(id: &str, duration_secs: u32) -> VideoRequest {
    VideoRequest::new(id, format!("vid-{id}"), format!("Song {id}"), Some(duration_secs))
}

pub fn video(id: &str, views: u64) -> VideoInfo {
    VideoInfo {
        id: id.to_string(),
        title: format!("Video {id}"),
        duration_secs: Some(200),
        view_count: views,
        is_live: false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateCall {
    pub title: String,
    pub labels: Vec<String>,
    pub window_secs: u32,
}

#[derive(Default)]
pub struct FakeVotes {
    pub creates: Mutex<Vec<CreateCall>>,
    pub closes: Mutex<Vec<(String, VoteClose)>>,
    pub fail_create: AtomicBool,
    counter: AtomicUsize,
}

impl FakeVotes {
    pub fn creates(&self) -> Vec<CreateCall> {
        self.creates.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<(String, VoteClose)> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl VotePlatform for FakeVotes {
    async fn create_vote(&self, title: &str, labels: &[String], window_secs: u32) -> ApiResult<OpenedVote> {
        self.creates.lock().unwrap().push(CreateCall {
            title: title.to_string(),
            labels: labels.to_vec(),
            window_secs,
        });
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ApiError::Malformed("outcome rejected".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OpenedVote {
            vote_id: format!("vote-{n}"),
            outcome_ids: (0..labels.len()).map(|i| format!("vote-{n}-out-{i}")).collect(),
        })
    }

    async fn close_vote(&self, vote_id: &str, close: VoteClose) -> ApiResult<()> {
        self.closes.lock().unwrap().push((vote_id.to_string(), close));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCall {
    Load(String),
    Play,
    Stop,
}

#[derive(Default)]
pub struct FakePlayer {
    pub calls: Mutex<Vec<PlayerCall>>,
    /// Refuse loads, as if no widget were connected.
    pub offline: AtomicBool,
}

impl FakePlayer {
    pub fn calls(&self) -> Vec<PlayerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn loaded(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlayerCall::Load(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

impl Player for FakePlayer {
    fn load(&self, video_id: &str) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return false;
        }
        self.calls.lock().unwrap().push(PlayerCall::Load(video_id.to_string()));
        true
    }

    fn play(&self) {
        self.calls.lock().unwrap().push(PlayerCall::Play);
    }

    fn stop(&self) {
        self.calls.lock().unwrap().push(PlayerCall::Stop);
    }
}

#[derive(Default)]
pub struct FakeLookup {
    pub results: Mutex<HashMap<String, Vec<VideoInfo>>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeLookup {
    pub fn with(self, query: &str, videos: Vec<VideoInfo>) -> Self {
        self.results.lock().unwrap().insert(query.to_string(), videos);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl VideoLookup for FakeLookup {
    async fn resolve(&self, query: &str) -> ApiResult<Vec<VideoInfo>> {
        self.queries.lock().unwrap().push(query.to_string());
        self.results
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .ok_or(ApiError::Empty("search"))
    }
}
