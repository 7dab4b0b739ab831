//! Twitch integration: Helix REST calls and the EventSub websocket transport.

pub mod eventsub;
pub mod helix;

use anyhow::Context;
use tracing::info;

use crate::config::{RewardCosts, SKIP_REWARD_TITLE, SONG_REWARD_PROMPT, SONG_REWARD_TITLE};
use helix::{HelixClient, RewardSpec};

/// Reward ids the engine routes on.
#[derive(Clone, Debug)]
pub struct RewardIds {
    pub song: String,
    pub skip: String,
}

pub fn reward_specs(costs: &RewardCosts) -> (RewardSpec, RewardSpec) {
    let song = RewardSpec {
        title: SONG_REWARD_TITLE.to_string(),
        cost: costs.song,
        is_user_input_required: true,
        prompt: Some(SONG_REWARD_PROMPT.to_string()),
        should_redemptions_skip_request_queue: true,
    };
    let skip = RewardSpec {
        title: SKIP_REWARD_TITLE.to_string(),
        cost: costs.skip,
        is_user_input_required: false,
        prompt: None,
        should_redemptions_skip_request_queue: true,
    };
    (song, skip)
}

/// Replace whatever rewards this client manages with a fresh song-request and
/// skip pair.
pub async fn provision_rewards(helix: &HelixClient, costs: &RewardCosts) -> anyhow::Result<RewardIds> {
    let removed = helix
        .delete_manageable_rewards()
        .await
        .context("failed to clear existing rewards")?;
    if removed > 0 {
        info!("removed {removed} previously created rewards");
    }

    let (song, skip) = reward_specs(costs);
    let song = helix.create_reward(&song).await.context("failed to create song reward")?;
    let skip = helix.create_reward(&skip).await.context("failed to create skip reward")?;
    Ok(RewardIds { song, skip })
}
