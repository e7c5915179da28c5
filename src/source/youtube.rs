use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::YouTubeConfig;
use crate::fetch::get_json;

use super::{join_segments, parse_url, FeedRef, Item, Source, SourceKind};

const API_BASE: &str = "https://www.googleapis.com/youtube/v3/";
const CHANNEL_BASE: &str = "https://www.youtube.com/channel/";
const WATCH_URL: &str = "https://www.youtube.com/watch";
const PAGE_SIZE: u32 = 50;
const MAX_PAGES: usize = 2;
const MAX_IDS_PER_LOOKUP: usize = 50;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<Channel>,
}

#[derive(Deserialize, Debug)]
struct Channel {
    id: String,
    snippet: ChannelSnippet,
}

#[derive(Deserialize, Debug)]
struct ChannelSnippet {
    title: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SearchResult {
    id: SearchResultId,
    snippet: VideoSnippet,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SearchResultId {
    video_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: String,
    published_at: String,
}

pub struct YouTubeSource {
    http_client: ClientWithMiddleware,
    api_key: String,
    api_base: Url,
    channel_base: Url,
    channel_names: HashMap<String, String>,
}

impl YouTubeSource {
    pub fn new(http_client: ClientWithMiddleware, cfg: &YouTubeConfig) -> Result<Self> {
        Ok(Self {
            http_client,
            api_key: cfg
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("missing required field `youtube.api-key`"))?,
            api_base: parse_url(API_BASE)?,
            channel_base: parse_url(CHANNEL_BASE)?,
            channel_names: HashMap::new(),
        })
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.api_base
            .join(name)
            .with_context(|| anyhow!("could not build the `{name}` endpoint URL"))
    }

    async fn lookup_channel_names(&self, ids: &[&str]) -> Result<HashMap<String, String>> {
        let url = self.endpoint("channels")?;
        let max_results = MAX_IDS_PER_LOOKUP.to_string();
        let mut names = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(MAX_IDS_PER_LOOKUP) {
            let joined = chunk.join(",");
            let request = self.http_client.get(url.clone()).query(&[
                ("part", "snippet"),
                ("id", joined.as_str()),
                ("maxResults", max_results.as_str()),
                ("key", self.api_key.as_str()),
            ]);
            let response: ChannelListResponse =
                get_json(request, "YouTube channel names").await?;

            names.extend(
                response
                    .items
                    .into_iter()
                    .map(|channel| (channel.id, channel.snippet.title)),
            );
        }

        Ok(names)
    }
}

#[async_trait]
impl Source for YouTubeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::YouTube
    }

    async fn prepare(&mut self, feeds: &[&str]) -> Result<()> {
        if feeds.is_empty() {
            return Ok(());
        }

        match self.lookup_channel_names(feeds).await {
            Ok(names) => {
                debug!("Resolved {} of {} channel names", names.len(), feeds.len());
                self.channel_names = names;
            }

            Err(e) => {
                warn!("Could not resolve channel names; falling back to channel ids: {e:#}");
                self.channel_names.clear();
            }
        }

        Ok(())
    }

    async fn fetch_feed(&self, feed: &FeedRef, since: OffsetDateTime) -> Result<Vec<Item>> {
        let url = self.endpoint("search")?;
        let published_after = since
            .format(&Rfc3339)
            .with_context(|| anyhow!("could not format the timestamp {since}"))?;
        let page_size = PAGE_SIZE.to_string();
        let mut page_token: Option<String> = None;
        let mut items = vec![];

        for page in 1..=MAX_PAGES {
            let mut query = vec![
                ("part", "snippet"),
                ("channelId", feed.id.as_str()),
                ("publishedAfter", published_after.as_str()),
                ("order", "date"),
                ("type", "video"),
                ("maxResults", page_size.as_str()),
                ("key", self.api_key.as_str()),
            ];

            if let Some(page_token) = &page_token {
                query.push(("pageToken", page_token.as_str()));
            }

            let request = self.http_client.get(url.clone()).query(&query);
            let response: SearchResponse =
                get_json(request, &format!("page {page} of channel `{}`", feed.id)).await?;

            items.extend(parse_search_results(response.items, feed));
            page_token = response.next_page_token;

            if page_token.is_none() {
                break;
            }

            if page == MAX_PAGES {
                debug!(feed = %feed.id, "Reached the page limit; older videos are deferred");
            }
        }

        Ok(items)
    }

    fn feed_ref(&self, feed: &str) -> FeedRef {
        FeedRef {
            id: feed.into(),
            name: self
                .channel_names
                .get(feed)
                .cloned()
                .unwrap_or_else(|| feed.into()),
            url: join_segments(&self.channel_base, [feed]),
        }
    }
}

fn parse_search_results(results: Vec<SearchResult>, feed: &FeedRef) -> Vec<Item> {
    results
        .into_iter()
        .filter_map(|result| {
            let Some(video_id) = result.id.video_id else {
                debug!(feed = %feed.id, "Skipping a search result that is not a video");
                return None;
            };

            let published = OffsetDateTime::parse(&result.snippet.published_at, &Rfc3339)
                .inspect_err(|e| {
                    warn!(
                        feed = %feed.id, %video_id,
                        "Skipping a video with a malformed publication date: {e}",
                    );
                })
                .ok()?;

            let mut url = parse_url(WATCH_URL).ok()?;
            url.query_pairs_mut().append_pair("v", &video_id);

            Some(Item {
                title: result.snippet.title,
                url,
                published,
                feed: feed.clone(),
                category: None,
                score: None,
                kind: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn source() -> YouTubeSource {
        YouTubeSource::new(
            reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build(),
            &YouTubeConfig {
                enabled: true,
                api_key: Some("key".into()),
                channels: Some(vec!["UC123".into()]),
                categories: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn search_results_become_items() {
        let source = source();
        let feed = source.feed_ref("UC123");
        let response: SearchResponse = serde_json::from_value(json!({
            "items": [
                {
                    "id": { "kind": "youtube#video", "videoId": "vid1" },
                    "snippet": { "title": "First video", "publishedAt": "2024-01-02T10:00:00Z" }
                },
                {
                    "id": { "kind": "youtube#playlist", "playlistId": "pl1" },
                    "snippet": { "title": "A playlist", "publishedAt": "2024-01-02T11:00:00Z" }
                },
                {
                    "id": { "kind": "youtube#video", "videoId": "vid2" },
                    "snippet": { "title": "Broken date", "publishedAt": "yesterday" }
                }
            ],
            "nextPageToken": "CAUQAA"
        }))
        .unwrap();

        assert_eq!(response.next_page_token.as_deref(), Some("CAUQAA"));

        let items = parse_search_results(response.items, &feed);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "First video");
        assert_eq!(items[0].url.as_str(), "https://www.youtube.com/watch?v=vid1");
        assert_eq!(
            items[0].published,
            time::macros::datetime!(2024-01-02 10:00:00 UTC)
        );
        assert_eq!(items[0].kind, None);
    }

    #[test]
    fn channel_names_fall_back_to_ids() {
        let mut source = source();
        source
            .channel_names
            .insert("UC123".into(), "Tech Channel".into());

        let named = source.feed_ref("UC123");
        assert_eq!(named.name, "Tech Channel");
        assert_eq!(named.url.as_str(), "https://www.youtube.com/channel/UC123");

        assert_eq!(source.feed_ref("UC456").name, "UC456");
    }

    #[test]
    fn channel_lookup_response_parses() {
        let response: ChannelListResponse = serde_json::from_value(json!({
            "kind": "youtube#channelListResponse",
            "items": [
                { "id": "UC1", "snippet": { "title": "One" } },
                { "id": "UC2", "snippet": { "title": "Two" } }
            ]
        }))
        .unwrap();

        let names = response
            .items
            .into_iter()
            .map(|c| (c.id, c.snippet.title))
            .collect::<HashMap<_, _>>();
        assert_eq!(names["UC2"], "Two");
    }
}
