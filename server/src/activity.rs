use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const MAX_DISPLAY_SESSIONS: usize = 4;
pub const PLACEHOLDER_POSTER: &str = "https://placehold.co/120x180/eee/ccc?text=No+Art";

/// `data` block of Tautulli's `get_activity` response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawActivity {
    #[serde(default)]
    pub stream_count: serde_json::Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sessions: Vec<RawSession>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawSession {
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub player: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub grandparent_title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub media_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub thumb: String,
    #[serde(default)]
    pub progress_percent: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySession {
    pub user: String,
    pub player: String,
    pub display_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub poster_url: String,
    pub progress: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayPage {
    pub stream_count: u32,
    pub sessions: Vec<DisplaySession>,
    pub generated_at: String,
}

/// How poster URLs are written into a page. Borrowed from the endpoint the
/// page was fetched with.
#[derive(Clone, Copy, Debug)]
pub enum PosterLinks<'a> {
    Direct {
        base_url: &'a str,
        api_key: &'a str,
    },
    Proxy {
        /// `(tautulli_url, api_key)` to embed when the proxy request cannot
        /// fall back to server-side configuration.
        credentials: Option<(&'a str, &'a str)>,
    },
}

impl PosterLinks<'_> {
    pub fn resolve(&self, thumb: &str) -> String {
        if thumb.trim().is_empty() {
            return PLACEHOLDER_POSTER.to_string();
        }
        let img = urlencoding::encode(thumb);
        match self {
            PosterLinks::Direct { base_url, api_key } => format!(
                "{base_url}/api/v2?apikey={}&cmd=pms_image_proxy&img={img}",
                urlencoding::encode(api_key)
            ),
            PosterLinks::Proxy { credentials: None } => format!("/image?img={img}"),
            PosterLinks::Proxy {
                credentials: Some((base_url, api_key)),
            } => format!(
                "/image?img={img}&tautulli_url={}&api_key={}",
                urlencoding::encode(base_url),
                urlencoding::encode(api_key)
            ),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Tautulli sends counters as strings ("3") or numbers depending on version.
fn lenient_int(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn parse_progress(value: &serde_json::Value) -> u8 {
    lenient_int(value).map(|p| p.clamp(0, 100) as u8).unwrap_or(0)
}

pub fn parse_stream_count(value: &serde_json::Value) -> u32 {
    lenient_int(value)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

pub fn normalize_session(raw: RawSession, posters: &PosterLinks<'_>) -> DisplaySession {
    let poster_url = posters.resolve(&raw.thumb);
    let progress = parse_progress(&raw.progress_percent);
    let (display_title, subtitle) = if raw.media_type == "episode" {
        (raw.grandparent_title, Some(raw.title))
    } else {
        (raw.title, None)
    };
    DisplaySession {
        user: raw.user,
        player: raw.player,
        display_title,
        subtitle,
        poster_url,
        progress,
    }
}

pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    at.format("%-I:%M %p").to_string()
}

pub fn assemble<Tz>(raw: RawActivity, posters: &PosterLinks<'_>, now: &DateTime<Tz>) -> DisplayPage
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let stream_count = parse_stream_count(&raw.stream_count);
    let sessions = raw
        .sessions
        .into_iter()
        .take(MAX_DISPLAY_SESSIONS)
        .map(|s| normalize_session(s, posters))
        .collect();
    DisplayPage {
        stream_count,
        sessions,
        generated_at: format_timestamp(now),
    }
}
