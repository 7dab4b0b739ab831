use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::ApiResult;
use crate::events::{EngineEvent, EventTx, Redemption};
use crate::platform::{VideoInfo, VideoLookup};
use crate::queue::VideoRequest;

/// Distinct query strings remembered before the cache starts over.
const LOOKUP_CACHE_CAPACITY: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedemptionKind {
    SongRequest,
    SkipSong,
    Unknown,
}

/// Maps redemptions to handlers by reward id and owns the lookup cache.
pub struct RedemptionRouter {
    song_reward_id: String,
    skip_reward_id: String,
    cache: HashMap<String, Vec<VideoInfo>>,
}

/// First result that passes validation, as a queue entry for `redemption`.
pub fn pick_request(redemption: &Redemption, results: &[VideoInfo], cfg: &EngineConfig) -> Option<VideoRequest> {
    let video = results
        .iter()
        .find(|v| v.is_valid(cfg.min_view_count, cfg.allow_live))?;

    let mut req = VideoRequest::new(
        redemption.id.clone(),
        video.id.clone(),
        video.title.clone(),
        if video.is_live { None } else { video.duration_secs },
    );
    req.requested_by = redemption.user_login.clone();
    req.redeemed_at = redemption.redeemed_at;
    Some(req)
}

impl RedemptionRouter {
    pub fn new(song_reward_id: impl Into<String>, skip_reward_id: impl Into<String>) -> Self {
        Self {
            song_reward_id: song_reward_id.into(),
            skip_reward_id: skip_reward_id.into(),
            cache: HashMap::new(),
        }
    }

    pub fn classify(&self, reward_id: &str) -> RedemptionKind {
        if reward_id.is_empty() {
            RedemptionKind::Unknown
        } else if reward_id == self.song_reward_id {
            RedemptionKind::SongRequest
        } else if reward_id == self.skip_reward_id {
            RedemptionKind::SkipSong
        } else {
            RedemptionKind::Unknown
        }
    }

    /// Handle a song request. A cached query yields the entry right away;
    /// otherwise a lookup is started and the answer arrives later as
    /// [`EngineEvent::LookupFinished`].
    pub fn song_request(
        &mut self,
        redemption: Redemption,
        lookup: &Arc<dyn VideoLookup>,
        tx: &EventTx,
        cfg: &EngineConfig,
    ) -> Option<VideoRequest> {
        let query = redemption.user_input.trim().to_string();
        if query.is_empty() {
            warn!("song request {} from {} has no input", redemption.id, redemption.user_login);
            return None;
        }

        if let Some(results) = self.cache.get(&query) {
            debug!("lookup cache hit for {query:?}");
            let req = pick_request(&redemption, results, cfg);
            if req.is_none() {
                info!("no playable video for {query:?} (cached)");
            }
            return req;
        }

        let lookup = lookup.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let result = lookup.resolve(&query).await;
            let _ = tx.send(EngineEvent::LookupFinished { redemption, result });
        });
        None
    }

    pub fn lookup_finished(
        &mut self,
        redemption: Redemption,
        result: ApiResult<Vec<VideoInfo>>,
        cfg: &EngineConfig,
    ) -> Option<VideoRequest> {
        let query = redemption.user_input.trim().to_string();
        let results = match result {
            Ok(results) => results,
            Err(e) => {
                warn!("lookup for {query:?} failed: {e}");
                return None;
            }
        };

        let req = pick_request(&redemption, &results, cfg);
        if req.is_none() {
            info!("no playable video for {query:?} ({} results)", results.len());
        }
        if !results.is_empty() {
            if self.cache.len() >= LOOKUP_CACHE_CAPACITY {
                self.cache.clear();
            }
            self.cache.insert(query, results);
        }
        req
    }

    #[cfg(test)]
    pub fn cached_queries(&self) -> usize {
        self.cache.len()
    }
}
