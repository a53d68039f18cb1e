use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::info;

use crate::error::Error;
use crate::stem::{stem_line, stem_words};
use crate::store::{Channel, Store, TranscriptLine, Video};

/// Videos searched concurrently per query.
const SEARCH_WORKERS: usize = 20;

/// Cap on matching videos returned for one query.
const MAX_RESULTS: usize = 100;

/// Queries shorter than this are rejected at the serving edge.
pub const MIN_QUERY_LEN: usize = 3;

/// One matching video with the transcript lines the query matched in.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub video: Video,
    pub lines: Vec<TranscriptLine>,
}

/// Search every video of a channel for `raw_query`, newest first.
///
/// The candidate set is first narrowed with a cheap substring pre-filter over
/// the searchable transcripts, then each candidate gets the exact scan of
/// [`search_video`]. Matched line ids are inflated in one bulk query.
pub async fn search_channel(
    store: &Store,
    channel: &Channel,
    raw_query: &str,
) -> Result<Vec<SearchResult>> {
    let stemmed_query = stem_line(raw_query);
    let words = stem_words(raw_query);

    let videos = store
        .videos_of_channel_with_words(&channel.id, &words)
        .await
        .context("retrieving channel videos")?;
    info!("🔎 searching through {} optimistic video matches", videos.len());

    let semaphore = Arc::new(Semaphore::new(SEARCH_WORKERS));
    let matches: Arc<Mutex<Vec<(Video, Vec<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut workers = JoinSet::new();

    for video in videos {
        let stemmed_query = stemmed_query.clone();
        let semaphore = Arc::clone(&semaphore);
        let matches = Arc::clone(&matches);

        workers.spawn(async move {
            let _permit = semaphore.acquire_owned().await.unwrap();

            let ids = search_video(&video, &stemmed_query)?;
            if !ids.is_empty() {
                matches.lock().unwrap().push((video, ids));
            }

            Ok::<(), anyhow::Error>(())
        });
    }

    while let Some(joined) = workers.join_next().await {
        joined.context("search worker panicked")??;
    }

    let mut matches = std::mem::take(&mut *matches.lock().unwrap());
    matches.sort_by(|a, b| b.0.published_at.cmp(&a.0.published_at));

    if matches.len() > MAX_RESULTS {
        info!("capping {} video matches to {}", matches.len(), MAX_RESULTS);
        matches.truncate(MAX_RESULTS);
    }

    // Flatten all matched ids so one query inflates every transcript line.
    let all_ids: Vec<i64> = matches
        .iter()
        .flat_map(|(_, ids)| ids.iter().copied())
        .collect();
    info!("retrieving {} matched lines", all_ids.len());
    let lines = store
        .transcripts_by_ids(&all_ids)
        .await
        .context("querying transcripts")?;

    Ok(matches
        .into_iter()
        .map(|(video, ids)| SearchResult {
            lines: ids.iter().filter_map(|id| lines.get(id).cloned()).collect(),
            video,
        })
        .collect())
}

/// Scan a video's searchable transcript for `stemmed_query`, returning the
/// ids of the matching transcript lines in scan order.
///
/// One O(n) pass over the compact form. Meta spans (`~<line id>~`) take the
/// place of the whitespace between the last word of one line and the first
/// word of the next, so phrase matches cross line boundaries. A match that
/// spans two lines is attributed to the line it completes in, whose
/// timestamp is where playback should start.
///
/// The query must already be stemmed; the restart on mismatch is a naive
/// reset, which is fine because queries are short and the candidate set was
/// pre-filtered.
pub fn search_video(video: &Video, stemmed_query: &str) -> Result<Vec<i64>> {
    let query: Vec<char> = stemmed_query.chars().collect();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let transcript = &video.searchable_transcript;
    let mut hits = Vec::new();
    let mut current_line: Option<i64> = None;
    let mut in_meta = false;
    let mut meta_start = 0;
    let mut progress = 0;

    for (i, ch) in transcript.char_indices() {
        if ch == '~' {
            if in_meta {
                in_meta = false;

                let meta = &transcript[meta_start..i];
                let id: i64 = meta.parse().map_err(|e| Error::Malformed {
                    what: "searchable transcript meta",
                    detail: format!("{meta:?} in video {}: {e}", video.id),
                    dump: None,
                })?;
                current_line = Some(id);

                // The line join behaves like interword whitespace: advance a
                // pending space, hold if a literal space already consumed
                // it, otherwise start over.
                if progress > 0 {
                    if query[progress] == ' ' {
                        progress += 1;
                    } else if query[progress - 1] != ' ' {
                        progress = 0;
                    }
                }
            } else {
                in_meta = true;
                meta_start = i + 1;
            }

            continue;
        }

        if in_meta {
            continue;
        }

        if query[progress] == ch {
            progress += 1;
        } else {
            progress = 0;
        }

        if progress == query.len() {
            if let Some(id) = current_line {
                if hits.last() != Some(&id) {
                    hits.push(id);
                }
            }
            progress = 0;
        }
    }

    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TranscriptType;
    use chrono::Utc;

    fn video(searchable_transcript: &str) -> Video {
        Video {
            id: "vid1".to_string(),
            channel_id: "chan1".to_string(),
            published_at: Utc::now(),
            title: String::new(),
            description: String::new(),
            thumbnail_url: String::new(),
            searchable_transcript: searchable_transcript.to_string(),
            transcript_type: TranscriptType::TubeManual,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_match_spanning_lines_hits_second_line() {
        // E1: the meta span between the lines acts as the interword space.
        let vid = video("~12~hello there ~13~friend today");
        assert_eq!(search_video(&vid, "there friend").unwrap(), vec![13]);
    }

    #[test]
    fn test_no_match() {
        // E2
        let vid = video("~12~hello there ~13~friend today");
        assert_eq!(search_video(&vid, "xyz").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_multiple_matches_reset_between() {
        // E3
        let vid = video("~1~the quick ~2~brown fox ~3~the quick brown");
        assert_eq!(search_video(&vid, "the quick").unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_span_without_trailing_space_before_meta() {
        // Compact fields built without padding still join lines as a space.
        let vid = video("~12~hello there~13~friend today");
        assert_eq!(search_video(&vid, "there friend").unwrap(), vec![13]);
    }

    #[test]
    fn test_meta_does_not_join_words_without_space_in_query() {
        let vid = video("~1~ab~2~cd");
        assert_eq!(search_video(&vid, "abcd").unwrap(), Vec::<i64>::new());
        assert_eq!(search_video(&vid, "ab cd").unwrap(), vec![2]);
    }

    #[test]
    fn test_match_at_end_of_transcript_is_recorded() {
        let vid = video("~7~hello world");
        assert_eq!(search_video(&vid, "world").unwrap(), vec![7]);
    }

    #[test]
    fn test_repeated_match_in_one_line_collapses() {
        let vid = video("~4~dog dog dog");
        assert_eq!(search_video(&vid, "dog").unwrap(), vec![4]);
    }

    #[test]
    fn test_empty_transcript_and_empty_query() {
        let vid = video("");
        assert_eq!(search_video(&vid, "anything").unwrap(), Vec::<i64>::new());

        let vid = video("~1~hello");
        assert_eq!(search_video(&vid, "").unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_hits_are_ascending_scan_order_without_consecutive_dupes() {
        let vid = video("~1~lorem ipsum ~2~ipsum ~3~dolor ipsum sit ipsum");
        let hits = search_video(&vid, "ipsum").unwrap();
        assert_eq!(hits, vec![1, 2, 3]);
        assert!(hits.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_malformed_meta_is_an_error() {
        let vid = video("~12a~hello");
        assert!(search_video(&vid, "hello").is_err());
    }

    #[tokio::test]
    async fn test_search_channel_end_to_end() {
        use crate::store::{NewTranscriptLine, NewVideo};
        use chrono::TimeZone;

        let store = Store::open_in_memory().await.unwrap();
        let channel = store
            .create_channel("chan1", "Test", "uploads", "")
            .await
            .unwrap();

        let line = |start: f64, text: &str| NewTranscriptLine {
            start,
            duration: Some(2.0),
            text: text.to_string(),
            stemmed: stem_line(text),
        };

        store
            .insert_video_with_transcript(
                NewVideo {
                    id: "older".to_string(),
                    channel_id: "chan1".to_string(),
                    published_at: Utc.timestamp_opt(1_000, 0).unwrap(),
                    title: String::new(),
                    description: String::new(),
                    thumbnail_url: String::new(),
                    transcript_type: TranscriptType::TubeManual,
                },
                vec![line(0.0, "thanks for watching"), line(2.0, "see you next time")],
            )
            .await
            .unwrap();
        store
            .insert_video_with_transcript(
                NewVideo {
                    id: "newer".to_string(),
                    channel_id: "chan1".to_string(),
                    published_at: Utc.timestamp_opt(2_000, 0).unwrap(),
                    title: String::new(),
                    description: String::new(),
                    thumbnail_url: String::new(),
                    transcript_type: TranscriptType::TubeAuto,
                },
                vec![line(0.0, "no watching here"), line(3.0, "thanks for watching!")],
            )
            .await
            .unwrap();

        // Stemming makes "watched" match "watching".
        let results = search_channel(&store, &channel, "thanks for watched")
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        // Newest video first.
        assert_eq!(results[0].video.id, "newer");
        assert_eq!(results[1].video.id, "older");

        assert_eq!(results[0].lines.len(), 1);
        assert_eq!(results[0].lines[0].text, "thanks for watching!");
        assert_eq!(results[0].lines[0].start, 3.0);
        assert_eq!(results[1].lines[0].start, 0.0);

        // No hits at all for nonsense.
        let results = search_channel(&store, &channel, "zebra crossing")
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
