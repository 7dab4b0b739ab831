use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ApiError, ApiResult};
use crate::platform::{VideoInfo, VideoLookup};

const YOUTUBE_BASE: &str = "https://www.googleapis.com/youtube/v3";
const SEARCH_RESULTS: &str = "5";

// --- Wire format --------------------------------------------------------------

#[derive(Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct VideoItem {
    id: String,
    snippet: Snippet,
    #[serde(rename = "contentDetails", default)]
    content_details: Option<ContentDetails>,
    #[serde(default)]
    statistics: Option<Statistics>,
}

#[derive(Deserialize)]
struct Snippet {
    title: String,
    #[serde(rename = "liveBroadcastContent", default)]
    live_broadcast_content: Option<String>,
}

#[derive(Deserialize)]
struct ContentDetails {
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Deserialize)]
struct Statistics {
    #[serde(rename = "viewCount", default)]
    view_count: Option<String>,
}

#[derive(Deserialize)]
struct SearchItem {
    id: SearchId,
}

#[derive(Deserialize)]
struct SearchId {
    #[serde(rename = "videoId", default)]
    video_id: Option<String>,
}

impl VideoItem {
    /// `None` when a non-live video has no usable duration.
    fn into_info(self) -> Option<VideoInfo> {
        let is_live = self
            .snippet
            .live_broadcast_content
            .as_deref()
            .is_some_and(|c| c != "none");
        let duration_secs = if is_live {
            None
        } else {
            let raw = self.content_details.and_then(|d| d.duration)?;
            match parse_iso8601_duration(&raw) {
                Some(d) => Some(d),
                None => {
                    warn!("video {} has unreadable duration {raw:?}", self.id);
                    return None;
                }
            }
        };
        let view_count = self
            .statistics
            .and_then(|s| s.view_count)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Some(VideoInfo {
            id: self.id,
            title: self.snippet.title,
            duration_secs,
            view_count,
            is_live,
        })
    }
}

/// Parse `PnDTnHnMnS` style durations into whole seconds. Fractional seconds
/// are truncated.
pub fn parse_iso8601_duration(s: &str) -> Option<u32> {
    let rest = s.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    fn fields(part: &str, units: &[(char, u32)]) -> Option<u32> {
        let mut total: u32 = 0;
        let mut num = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                num.push(ch);
                continue;
            }
            let (_, scale) = units.iter().find(|(u, _)| *u == ch)?;
            let whole = num.split('.').next().unwrap_or("");
            let value: u32 = whole.parse().ok()?;
            total = total.checked_add(value.checked_mul(*scale)?)?;
            num.clear();
        }
        if !num.is_empty() {
            return None;
        }
        Some(total)
    }

    let days = fields(date, &[('W', 7 * 86_400), ('D', 86_400)])?;
    let clock = match time {
        Some(t) if t.is_empty() => return None,
        Some(t) => fields(t, &[('H', 3600), ('M', 60), ('S', 1)])?,
        None => 0,
    };
    if date.is_empty() && time.is_none() {
        return None;
    }
    days.checked_add(clock)
}

fn is_video_id(s: &str) -> bool {
    s.len() == 11 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Pull the video id out of the usual YouTube link shapes.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();
    let url = Url::parse(input)
        .or_else(|_| Url::parse(&format!("https://{input}")))
        .ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");

    let id = match host {
        "youtu.be" => url.path_segments()?.next()?.to_string(),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            let mut segs = url.path_segments()?;
            match segs.next()? {
                "watch" => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned())?,
                "embed" | "shorts" | "v" | "live" => segs.next()?.to_string(),
                _ => return None,
            }
        }
        _ => return None,
    };

    is_video_id(&id).then_some(id)
}

/// [`VideoLookup`] backed by the YouTube Data API. Keys are tried in order;
/// a key that gets an error response (quota, revoked) hands over to the next.
#[derive(Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    base: String,
    keys: Vec<String>,
}

impl YouTubeClient {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: YOUTUBE_BASE.to_string(),
            keys,
        }
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &'static str, params: &[(&str, &str)]) -> ApiResult<T> {
        let mut last_err = ApiError::NoUsableKey;
        for (i, key) in self.keys.iter().enumerate() {
            let res = self
                .http
                .get(format!("{}/{endpoint}", self.base))
                .query(params)
                .query(&[("key", key.as_str())])
                .send()
                .await;
            let res = match res {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.into();
                    continue;
                }
            };
            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                warn!("youtube {endpoint} rejected key #{i}: {status}");
                last_err = ApiError::Status { endpoint, status, body };
                continue;
            }
            let text = res.text().await?;
            return serde_json::from_str(&text).map_err(|e| ApiError::Malformed(format!("{endpoint}: {e}")));
        }
        Err(last_err)
    }

    /// Details for `ids`, in the order given. Unknown ids are skipped.
    async fn videos(&self, ids: &[String]) -> ApiResult<Vec<VideoInfo>> {
        let joined = ids.join(",");
        let list: ListResponse<VideoItem> = self
            .get("videos", &[("part", "snippet,contentDetails,statistics"), ("id", joined.as_str())])
            .await?;
        let mut found: Vec<VideoInfo> = list.items.into_iter().filter_map(VideoItem::into_info).collect();
        found.sort_by_key(|v| ids.iter().position(|id| *id == v.id).unwrap_or(usize::MAX));
        Ok(found)
    }

    async fn search(&self, query: &str) -> ApiResult<Vec<String>> {
        let list: ListResponse<SearchItem> = self
            .get(
                "search",
                &[("part", "snippet"), ("type", "video"), ("maxResults", SEARCH_RESULTS), ("q", query)],
            )
            .await?;
        Ok(list.items.into_iter().filter_map(|i| i.id.video_id).collect())
    }
}

#[async_trait]
impl VideoLookup for YouTubeClient {
    async fn resolve(&self, query: &str) -> ApiResult<Vec<VideoInfo>> {
        let query = query.trim();

        if is_video_id(query) {
            let direct = self.videos(&[query.to_string()]).await?;
            if !direct.is_empty() {
                return Ok(direct);
            }
        }

        if let Some(id) = extract_video_id(query) {
            debug!("resolved link {query:?} to {id}");
            return self.videos(&[id]).await;
        }

        let ids = self.search(query).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.videos(&ids).await
    }
}
