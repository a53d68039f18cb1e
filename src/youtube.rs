use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::Error;

const ENDPOINT_CHANNELS: &str = "https://youtube.googleapis.com/youtube/v3/channels";
const ENDPOINT_PLAYLIST_ITEMS: &str = "https://www.googleapis.com/youtube/v3/playlistItems";
const ENDPOINT_VIDEOS: &str = "https://www.googleapis.com/youtube/v3/videos";

const PAGE_SIZE: u32 = 50;

/// Remote video platform as seen by the indexer and the acquisition
/// pipeline. The production implementation is [`Client`]; tests substitute
/// fakes.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Look up a channel's title, uploads playlist and thumbnails.
    async fn channel_info(&self, id: &str) -> Result<ChannelInfo>;

    /// Fetch one page (50 items) of an uploads playlist. Iteration is
    /// caller-driven: pass the previous page's `next_page_token` until it
    /// comes back `None`.
    async fn playlist_page(&self, playlist_id: &str, page_token: Option<&str>)
        -> Result<PlaylistPage>;

    /// Look up a single video's metadata.
    async fn video(&self, id: &str) -> Result<VideoInfo>;

    /// Fetch and parse the best caption track for a video.
    async fn captions(&self, video_id: &str) -> Result<(Vec<CaptionLine>, CaptionKind)>;
}

/// Thumbnail variant of a channel or video.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Thumbnail {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub title: String,
    pub uploads_playlist_id: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone)]
pub struct PlaylistPage {
    pub items: Vec<PlaylistItem>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlaylistItem {
    pub video_id: String,
    pub published_at: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub id: String,
    pub channel_id: String,
    pub published_at: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: String,
    pub live_broadcast_content: String,
}

impl VideoInfo {
    /// Live or upcoming broadcasts have no final audio to transcribe.
    pub fn is_broadcast(&self) -> bool {
        self.live_broadcast_content != "none"
    }
}

/// One timed caption line as served by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLine {
    pub start: f64,
    pub duration: Option<f64>,
    pub text: String,
}

/// Which kind of caption track was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionKind {
    Manual,
    Auto,
}

/// YouTube Data API + watch page client.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_key: String,
}

impl Client {
    pub fn new(api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { http, api_key }
    }

    async fn get_api_body(&self, url: &str, query: &[(&str, &str)]) -> Result<String> {
        let res = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;

        let status = res.status();
        let body = res.text().await.context("reading response body")?;

        if status != StatusCode::OK {
            if status == StatusCode::FORBIDDEN {
                return Err(Error::QuotaExceeded.into());
            }

            tracing::warn!("unexpected status {} from {}: {:?}", status, url, body);
            return Err(Error::UnexpectedStatus(status.as_u16()).into());
        }

        Ok(body)
    }
}

#[async_trait]
impl Platform for Client {
    async fn channel_info(&self, id: &str) -> Result<ChannelInfo> {
        let body = self
            .get_api_body(
                ENDPOINT_CHANNELS,
                &[
                    ("part", "contentDetails,snippet"),
                    ("id", id),
                    ("key", &self.api_key),
                ],
            )
            .await
            .with_context(|| format!("retrieving channel info for {id:?}"))?;

        let res: ResChannels =
            serde_json::from_str(&body).context("unmarshalling channels response")?;

        let item = match res.items.as_slice() {
            [item] => item,
            items => {
                return Err(anyhow!(
                    "channel info returned {} items, expected 1",
                    items.len()
                ))
            }
        };

        Ok(ChannelInfo {
            id: item.id.clone(),
            title: item.snippet.title.clone(),
            uploads_playlist_id: item.content_details.related_playlists.uploads.clone(),
            thumbnail_url: highest_res_thumbnail(&item.snippet.thumbnails).url,
        })
    }

    async fn playlist_page(
        &self,
        playlist_id: &str,
        page_token: Option<&str>,
    ) -> Result<PlaylistPage> {
        let max_results = PAGE_SIZE.to_string();
        let mut query = vec![
            ("part", "contentDetails,snippet,status"),
            ("playlistId", playlist_id),
            ("key", self.api_key.as_str()),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let body = self
            .get_api_body(ENDPOINT_PLAYLIST_ITEMS, &query)
            .await
            .with_context(|| format!("retrieving playlist {playlist_id:?} page"))?;

        let res: ResPlaylistItems =
            serde_json::from_str(&body).context("unmarshalling playlist items response")?;

        Ok(PlaylistPage {
            items: res
                .items
                .into_iter()
                .map(|item| PlaylistItem {
                    video_id: item.content_details.video_id,
                    published_at: item.content_details.video_published_at,
                    title: item.snippet.title,
                    description: item.snippet.description,
                    thumbnail_url: highest_res_thumbnail(&item.snippet.thumbnails).url,
                })
                .collect(),
            next_page_token: res.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn video(&self, id: &str) -> Result<VideoInfo> {
        let body = self
            .get_api_body(
                ENDPOINT_VIDEOS,
                &[("part", "snippet"), ("id", id), ("key", &self.api_key)],
            )
            .await
            .with_context(|| format!("retrieving video {id:?}"))?;

        let res: ResVideos =
            serde_json::from_str(&body).context("unmarshalling videos response")?;

        let item = res
            .items
            .into_iter()
            .next()
            .ok_or(Error::NotFound)
            .with_context(|| format!("video {id:?}"))?;

        Ok(VideoInfo {
            id: id.to_string(),
            channel_id: item.snippet.channel_id,
            published_at: item.snippet.published_at,
            title: item.snippet.title,
            description: item.snippet.description,
            thumbnail_url: highest_res_thumbnail(&item.snippet.thumbnails).url,
            live_broadcast_content: item.snippet.live_broadcast_content,
        })
    }

    async fn captions(&self, video_id: &str) -> Result<(Vec<CaptionLine>, CaptionKind)> {
        let res = self
            .http
            .get(format!("https://www.youtube.com/watch?v={video_id}"))
            .send()
            .await
            .context("requesting watch page")?;

        let status = res.status();
        let page = res.text().await.context("reading watch page body")?;

        if page.contains(r#"action="https://consent.youtube.com/s""#) {
            return Err(anyhow!("watch page served a consent form"));
        }

        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus(status.as_u16()))
                .with_context(|| format!("watch page for {video_id:?}"));
        }

        let raw_captions = match slice_captions_json(&page) {
            Some(raw) => raw,
            None => {
                if page.contains(r#"class="g-recaptcha""#) {
                    return Err(Error::TooManyRequests)
                        .with_context(|| format!("video {video_id:?} got captcha"));
                }

                if page.contains(r#""playabilityStatus""#) && page.contains(r#""ERROR""#) {
                    return Err(Error::Unavailable)
                        .with_context(|| format!("video {video_id:?} not playable"));
                }

                return Err(Error::NoCaptions.into());
            }
        };

        let track_list: ResCaptionsList = serde_json::from_str(raw_captions).map_err(|e| {
            Error::Malformed {
                what: "caption track json",
                detail: e.to_string(),
                dump: None,
            }
        })?;

        let tracks = track_list.player_captions_tracklist_renderer.caption_tracks;
        let (track, kind) = best_track(&tracks).ok_or(Error::NoCaptions)?;

        let res = self
            .http
            .get(&track.base_url)
            .send()
            .await
            .context("requesting caption track")?;

        if res.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus(res.status().as_u16()))
                .context("fetching caption track file");
        }

        let body = res.text().await.context("reading caption track body")?;
        let lines = parse_caption_xml(&body)?;

        Ok((lines, kind))
    }
}

/// Slice the caption-tracks JSON object out of a watch page. The blob sits
/// between the literal markers `"captions":` and `,"videoDetails`.
fn slice_captions_json(page: &str) -> Option<&str> {
    let start = page.find(r#""captions":"#)? + r#""captions":"#.len();
    let rest = &page[start..];
    let end = rest.find(r#","videoDetails"#)?;
    Some(&rest[..end])
}

/// Picks the best caption track: target-language manual, then
/// target-language any, then any manual, then any track at all.
fn best_track(tracks: &[ResTrack]) -> Option<(&ResTrack, CaptionKind)> {
    const TARGET_LANGUAGE: &str = "en";

    if let Some(t) = tracks
        .iter()
        .find(|t| t.language_code == TARGET_LANGUAGE && t.kind != "asr")
    {
        return Some((t, CaptionKind::Manual));
    }

    if let Some(t) = tracks.iter().find(|t| t.language_code == TARGET_LANGUAGE) {
        return Some((t, CaptionKind::Auto));
    }

    if let Some(t) = tracks.iter().find(|t| t.kind != "asr") {
        return Some((t, CaptionKind::Manual));
    }

    tracks.first().map(|t| (t, CaptionKind::Auto))
}

fn parse_caption_xml(body: &str) -> Result<Vec<CaptionLine>> {
    let doc: CaptionXml = quick_xml::de::from_str(body).map_err(|e| Error::Malformed {
        what: "caption xml",
        detail: e.to_string(),
        dump: None,
    })?;

    Ok(doc
        .entries
        .into_iter()
        .map(|entry| CaptionLine {
            start: entry.start,
            duration: entry.dur,
            text: entry.text,
        })
        .collect())
}

/// Pick the highest-resolution thumbnail the platform offers.
pub fn highest_res_thumbnail(thumbs: &HashMap<String, Thumbnail>) -> Thumbnail {
    for res in ["maxres", "high", "medium", "standard", "default"] {
        if let Some(thumb) = thumbs.get(res) {
            return thumb.clone();
        }
    }

    Thumbnail {
        url: "https://placehold.co/600x400?text=No+Thumbnail".to_string(),
        width: 600,
        height: 400,
    }
}

/// Parse the platform's RFC 3339 published timestamps.
pub fn parse_published(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("parse published time {value:?}"))
}

// The response structs below outline only the JSON slices we consume; the
// API returns much more.

#[derive(Debug, Deserialize)]
struct ResChannels {
    #[serde(default)]
    items: Vec<ResChannelItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResChannelItem {
    id: String,
    content_details: ResChannelContentDetails,
    snippet: ResSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResChannelContentDetails {
    related_playlists: ResRelatedPlaylists,
}

#[derive(Debug, Deserialize)]
struct ResRelatedPlaylists {
    uploads: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnails: HashMap<String, Thumbnail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResPlaylistItems {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<ResPlaylistItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResPlaylistItem {
    content_details: ResPlaylistContentDetails,
    #[serde(default)]
    snippet: ResSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResPlaylistContentDetails {
    video_id: String,
    #[serde(default)]
    video_published_at: String,
}

#[derive(Debug, Deserialize)]
struct ResVideos {
    #[serde(default)]
    items: Vec<ResVideoItem>,
}

#[derive(Debug, Deserialize)]
struct ResVideoItem {
    snippet: ResVideoSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResVideoSnippet {
    #[serde(default)]
    published_at: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnails: HashMap<String, Thumbnail>,
    #[serde(default)]
    live_broadcast_content: String,
}

#[derive(Debug, Deserialize)]
struct ResCaptionsList {
    #[serde(rename = "playerCaptionsTracklistRenderer", default)]
    player_captions_tracklist_renderer: ResTracklistRenderer,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResTracklistRenderer {
    #[serde(default)]
    caption_tracks: Vec<ResTrack>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResTrack {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    language_code: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct CaptionXml {
    #[serde(rename = "text", default)]
    entries: Vec<CaptionEntryXml>,
}

#[derive(Debug, Deserialize)]
struct CaptionEntryXml {
    #[serde(rename = "@start")]
    start: f64,
    #[serde(rename = "@dur", default)]
    dur: Option<f64>,
    #[serde(rename = "$text", default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(language: &str, kind: &str) -> ResTrack {
        ResTrack {
            base_url: format!("https://example.test/{language}/{kind}"),
            language_code: language.to_string(),
            kind: kind.to_string(),
        }
    }

    #[test]
    fn test_best_track_prefers_english_manual() {
        let tracks = vec![track("nl", ""), track("en", "asr"), track("en", "")];
        let (best, kind) = best_track(&tracks).unwrap();
        assert_eq!(best.language_code, "en");
        assert_eq!(best.kind, "");
        assert_eq!(kind, CaptionKind::Manual);
    }

    #[test]
    fn test_best_track_falls_back_to_english_auto() {
        let tracks = vec![track("nl", "asr"), track("en", "asr")];
        let (best, kind) = best_track(&tracks).unwrap();
        assert_eq!(best.language_code, "en");
        assert_eq!(kind, CaptionKind::Auto);
    }

    #[test]
    fn test_best_track_falls_back_to_any_manual() {
        let tracks = vec![track("nl", "asr"), track("de", "")];
        let (best, kind) = best_track(&tracks).unwrap();
        assert_eq!(best.language_code, "de");
        assert_eq!(kind, CaptionKind::Manual);
    }

    #[test]
    fn test_best_track_last_resort_is_first_track() {
        let tracks = vec![track("nl", "asr"), track("de", "asr")];
        let (best, kind) = best_track(&tracks).unwrap();
        assert_eq!(best.language_code, "nl");
        assert_eq!(kind, CaptionKind::Auto);

        assert!(best_track(&[]).is_none());
    }

    #[test]
    fn test_slice_captions_json() {
        let page = r#"prefix"captions":{"playerCaptionsTracklistRenderer":{}},"videoDetails":{}"#;
        assert_eq!(
            slice_captions_json(page),
            Some(r#"{"playerCaptionsTracklistRenderer":{}}"#)
        );

        assert_eq!(slice_captions_json("no captions here"), None);
    }

    #[test]
    fn test_parse_caption_xml() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?><transcript><text start="1.3" dur="2.5">hello there</text><text start="3.8">general &amp;#39;kenobi&amp;#39;</text></transcript>"#;

        let lines = parse_caption_xml(xml).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].start, 1.3);
        assert_eq!(lines[0].duration, Some(2.5));
        assert_eq!(lines[0].text, "hello there");
        assert_eq!(lines[1].duration, None);
        // XML unescaping leaves the HTML layer intact; the indexer decodes it.
        assert_eq!(lines[1].text, "general &#39;kenobi&#39;");
    }

    #[test]
    fn test_parse_caption_xml_empty_is_legal() {
        let lines = parse_caption_xml("<transcript></transcript>").unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_highest_res_thumbnail_priority() {
        let mut thumbs = HashMap::new();
        thumbs.insert(
            "default".to_string(),
            Thumbnail { url: "d".into(), width: 120, height: 90 },
        );
        thumbs.insert(
            "high".to_string(),
            Thumbnail { url: "h".into(), width: 480, height: 360 },
        );
        assert_eq!(highest_res_thumbnail(&thumbs).url, "h");

        let placeholder = highest_res_thumbnail(&HashMap::new());
        assert!(placeholder.url.contains("placehold"));
    }

    #[test]
    fn test_parse_published() {
        let dt = parse_published("2023-04-25T21:27:49Z").unwrap();
        assert_eq!(dt.timestamp(), 1682458069);
        assert!(parse_published("not a time").is_err());
    }
}
