use serde::Serialize;
use time::OffsetDateTime;

// --- Request queue ----------------------------------------------------------
//
// Entries are kept in insertion order. Insertion order is the FIFO order used
// by `peek_next`, and also the walk order for the prediction look-ahead.

/// One queued song request.
///
/// `id` is the redemption id, so a redelivered notification maps onto the
/// same entry.
#[derive(Clone, Debug, Serialize)]
pub struct VideoRequest {
    pub id: String,
    pub video_id: String,
    pub title: String,
    /// `None` for live broadcasts.
    pub duration_secs: Option<u32>,
    pub requested_by: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub redeemed_at: Option<OffsetDateTime>,
    pub forced_next: bool,
    /// Only meaningful while a prediction round that includes this entry is
    /// scheduled or active.
    pub vote_outcome_id: Option<String>,
}

impl VideoRequest {
    pub fn new(id: impl Into<String>, video_id: impl Into<String>, title: impl Into<String>, duration_secs: Option<u32>) -> Self {
        Self {
            id: id.into(),
            video_id: video_id.into(),
            title: title.into(),
            duration_secs,
            requested_by: String::new(),
            redeemed_at: None,
            forced_next: false,
            vote_outcome_id: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.duration_secs.is_none()
    }
}

#[derive(Debug, Default)]
pub struct VideoQueue {
    entries: Vec<VideoRequest>,
}

impl VideoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. Returns false (and changes nothing) when the id is
    /// already queued.
    pub fn insert(&mut self, mut request: VideoRequest) -> bool {
        if self.entries.iter().any(|e| e.id == request.id) {
            return false;
        }
        // A fresh entry never carries override or vote state.
        request.forced_next = false;
        request.vote_outcome_id = None;
        self.entries.push(request);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<VideoRequest> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(idx))
    }

    /// The forced-next entry if there is one, otherwise the oldest entry.
    pub fn peek_next(&self) -> Option<&VideoRequest> {
        self.entries
            .iter()
            .find(|e| e.forced_next)
            .or_else(|| self.entries.first())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VideoRequest] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&VideoRequest> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn has_forced_next(&self) -> bool {
        self.entries.iter().any(|e| e.forced_next)
    }

    /// Set the override on exactly one entry. The flag is cleared everywhere
    /// else in the same pass, so there is never more than one forced entry.
    pub fn mark_forced_next(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        for e in &mut self.entries {
            e.forced_next = e.id == id;
        }
        true
    }

    pub fn assign_outcome(&mut self, id: &str, outcome_id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(e) => {
                e.vote_outcome_id = Some(outcome_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn find_by_outcome(&self, outcome_id: &str) -> Option<&VideoRequest> {
        self.entries
            .iter()
            .find(|e| e.vote_outcome_id.as_deref() == Some(outcome_id))
    }

    pub fn clear_outcomes(&mut self) {
        for e in &mut self.entries {
            e.vote_outcome_id = None;
        }
    }
}
