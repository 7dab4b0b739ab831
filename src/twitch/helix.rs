use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::platform::{OpenedVote, VoteClose, VotePlatform};

const HELIX_BASE: &str = "https://api.twitch.tv/helix";

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct PredictionData {
    id: String,
    #[serde(default)]
    outcomes: Vec<IdOnly>,
}

/// A channel-point reward to create.
#[derive(Clone, Debug, Serialize)]
pub struct RewardSpec {
    pub title: String,
    pub cost: u32,
    pub is_user_input_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub should_redemptions_skip_request_queue: bool,
}

/// Helix REST client for the calls this service makes: rewards, EventSub
/// subscriptions and predictions.
#[derive(Clone)]
pub struct HelixClient {
    http: reqwest::Client,
    base: String,
    client_id: String,
    token: String,
    broadcaster_id: String,
}

pub(crate) fn prediction_body(broadcaster_id: &str, title: &str, labels: &[String], window_secs: u32) -> Value {
    json!({
        "broadcaster_id": broadcaster_id,
        "title": title,
        "outcomes": labels.iter().map(|l| json!({ "title": l })).collect::<Vec<_>>(),
        "prediction_window": window_secs,
    })
}

pub(crate) fn end_prediction_body(broadcaster_id: &str, vote_id: &str, close: &VoteClose) -> Value {
    match close {
        VoteClose::Resolved(winner) => json!({
            "broadcaster_id": broadcaster_id,
            "id": vote_id,
            "status": "RESOLVED",
            "winning_outcome_id": winner,
        }),
        VoteClose::Canceled => json!({
            "broadcaster_id": broadcaster_id,
            "id": vote_id,
            "status": "CANCELED",
        }),
    }
}

pub(crate) fn subscription_body(kind: &str, condition: Value, session_id: &str) -> Value {
    json!({
        "type": kind,
        "version": "1",
        "condition": condition,
        "transport": {
            "method": "websocket",
            "session_id": session_id,
        },
    })
}

fn opened_vote(body: Envelope<PredictionData>) -> ApiResult<OpenedVote> {
    let p = body.data.into_iter().next().ok_or(ApiError::Empty("predictions"))?;
    Ok(OpenedVote {
        vote_id: p.id,
        outcome_ids: p.outcomes.into_iter().map(|o| o.id).collect(),
    })
}

impl HelixClient {
    pub fn new(client_id: impl Into<String>, token: impl Into<String>, broadcaster_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: HELIX_BASE.to_string(),
            client_id: client_id.into(),
            token: token.into(),
            broadcaster_id: broadcaster_id.into(),
        }
    }

    pub fn broadcaster_id(&self) -> &str {
        &self.broadcaster_id
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base))
            .header("Client-ID", &self.client_id)
            .bearer_auth(&self.token)
    }

    async fn send_raw(&self, rb: reqwest::RequestBuilder, endpoint: &'static str) -> ApiResult<reqwest::Response> {
        let res = rb.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Status { endpoint, status, body });
        }
        Ok(res)
    }

    async fn send_json<T: DeserializeOwned>(&self, rb: reqwest::RequestBuilder, endpoint: &'static str) -> ApiResult<T> {
        let res = self.send_raw(rb, endpoint).await?;
        let text = res.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Malformed(format!("{endpoint}: {e}")))
    }

    /// Delete every reward this client id is allowed to manage. Returns how
    /// many were removed.
    pub async fn delete_manageable_rewards(&self) -> ApiResult<usize> {
        let rb = self
            .request(Method::GET, "/channel_points/custom_rewards")
            .query(&[("broadcaster_id", self.broadcaster_id.as_str()), ("only_manageable_rewards", "true")]);
        let existing: Envelope<IdOnly> = self.send_json(rb, "custom_rewards").await?;

        for reward in &existing.data {
            let rb = self
                .request(Method::DELETE, "/channel_points/custom_rewards")
                .query(&[("broadcaster_id", self.broadcaster_id.as_str()), ("id", reward.id.as_str())]);
            self.send_raw(rb, "custom_rewards").await?;
            debug!("deleted reward {}", reward.id);
        }
        Ok(existing.data.len())
    }

    pub async fn create_reward(&self, spec: &RewardSpec) -> ApiResult<String> {
        let rb = self
            .request(Method::POST, "/channel_points/custom_rewards")
            .query(&[("broadcaster_id", self.broadcaster_id.as_str())])
            .json(spec);
        let body: Envelope<IdOnly> = self.send_json(rb, "custom_rewards").await?;
        let id = body
            .data
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or(ApiError::Empty("custom_rewards"))?;
        info!("created reward {:?} as {id}", spec.title);
        Ok(id)
    }

    pub async fn subscribe(&self, kind: &str, condition: Value, session_id: &str) -> ApiResult<String> {
        let rb = self
            .request(Method::POST, "/eventsub/subscriptions")
            .json(&subscription_body(kind, condition, session_id));
        let body: Envelope<IdOnly> = self.send_json(rb, "eventsub/subscriptions").await?;
        body.data
            .into_iter()
            .next()
            .map(|s| s.id)
            .ok_or(ApiError::Empty("eventsub/subscriptions"))
    }
}

#[async_trait]
impl VotePlatform for HelixClient {
    async fn create_vote(&self, title: &str, labels: &[String], window_secs: u32) -> ApiResult<OpenedVote> {
        let rb = self
            .request(Method::POST, "/predictions")
            .json(&prediction_body(&self.broadcaster_id, title, labels, window_secs));
        let body: Envelope<PredictionData> = self.send_json(rb, "predictions").await?;
        opened_vote(body)
    }

    async fn close_vote(&self, vote_id: &str, close: VoteClose) -> ApiResult<()> {
        let rb = self
            .request(Method::PATCH, "/predictions")
            .json(&end_prediction_body(&self.broadcaster_id, vote_id, &close));
        self.send_raw(rb, "predictions").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_body_lists_outcomes_in_order() {
        let body = prediction_body("b1", "Vote!", &["One".into(), "Two".into()], 58);
        assert_eq!(
            body,
            json!({
                "broadcaster_id": "b1",
                "title": "Vote!",
                "outcomes": [{"title": "One"}, {"title": "Two"}],
                "prediction_window": 58,
            })
        );
    }

    #[test]
    fn end_bodies_carry_status() {
        let resolved = end_prediction_body("b1", "p1", &VoteClose::Resolved("o2".into()));
        assert_eq!(resolved["status"], "RESOLVED");
        assert_eq!(resolved["winning_outcome_id"], "o2");

        let canceled = end_prediction_body("b1", "p1", &VoteClose::Canceled);
        assert_eq!(canceled["status"], "CANCELED");
        assert!(canceled.get("winning_outcome_id").is_none());
    }

    #[test]
    fn subscription_uses_websocket_transport() {
        let body = subscription_body("channel.prediction.lock", json!({"broadcaster_user_id": "b1"}), "s1");
        assert_eq!(body["transport"]["method"], "websocket");
        assert_eq!(body["transport"]["session_id"], "s1");
        assert_eq!(body["condition"]["broadcaster_user_id"], "b1");
    }

    #[test]
    fn created_prediction_maps_outcome_ids() {
        let raw = r#"{"data":[{"id":"p1","title":"Vote!","outcomes":[{"id":"o1","title":"A"},{"id":"o2","title":"B"}]}]}"#;
        let body: Envelope<PredictionData> = serde_json::from_str(raw).unwrap();
        let vote = opened_vote(body).unwrap();
        assert_eq!(vote.vote_id, "p1");
        assert_eq!(vote.outcome_ids, vec!["o1", "o2"]);
    }

    #[test]
    fn empty_prediction_response_is_an_error() {
        let body: Envelope<PredictionData> = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(opened_vote(body), Err(ApiError::Empty(_))));
        let body: Envelope<PredictionData> = serde_json::from_str(r#"{}"#).unwrap();
        assert!(matches!(opened_vote(body), Err(ApiError::Empty(_))));
    }

    #[test]
    fn reward_spec_omits_missing_prompt() {
        let spec = RewardSpec {
            title: "Skip Song".into(),
            cost: 5000,
            is_user_input_required: false,
            prompt: None,
            should_redemptions_skip_request_queue: true,
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert!(v.get("prompt").is_none());
        assert_eq!(v["cost"], 5000);
    }
}
