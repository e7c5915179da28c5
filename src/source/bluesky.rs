use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::fetch::get_json;

use super::{join_segments, parse_url, FeedRef, Item, Source, SourceKind};

const AUTHOR_FEED_URL: &str = "https://public.api.bsky.app/xrpc/app.bsky.feed.getAuthorFeed";
const PROFILE_BASE: &str = "https://bsky.app/profile/";
const PAGE_SIZE: u32 = 50;
const MAX_PAGES: usize = 2;
const MAX_TITLE_CHARS: usize = 100;

#[derive(Deserialize, Debug)]
struct AuthorFeed {
    #[serde(default)]
    feed: Vec<FeedViewPost>,
    cursor: Option<String>,
}

#[derive(Deserialize, Debug)]
struct FeedViewPost {
    post: PostView,
    /// Set on reposts and pinned posts, which sit outside the author's timeline order.
    reason: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct PostView {
    uri: String,
    author: Option<Author>,
    record: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct Author {
    handle: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    text: String,
    created_at: String,
}

pub struct BlueskySource {
    http_client: ClientWithMiddleware,
    feed_url: Url,
    profile_base: Url,
}

impl BlueskySource {
    pub fn new(http_client: ClientWithMiddleware) -> Result<Self> {
        Ok(Self {
            http_client,
            feed_url: parse_url(AUTHOR_FEED_URL)?,
            profile_base: parse_url(PROFILE_BASE)?,
        })
    }
}

#[async_trait]
impl Source for BlueskySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Bluesky
    }

    async fn fetch_feed(&self, feed: &FeedRef, since: OffsetDateTime) -> Result<Vec<Item>> {
        let limit = PAGE_SIZE.to_string();
        let mut cursor: Option<String> = None;
        let mut items = vec![];

        for page in 1..=MAX_PAGES {
            let mut query = vec![("actor", feed.id.as_str()), ("limit", limit.as_str())];

            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.as_str()));
            }

            let request = self.http_client.get(self.feed_url.clone()).query(&query);
            let response: AuthorFeed =
                get_json(request, &format!("page {page} of the posts by `{}`", feed.id)).await?;

            let (page_items, reached_watermark) =
                parse_author_feed(response.feed, feed, &self.profile_base, since);
            items.extend(page_items);
            cursor = response.cursor;

            if reached_watermark || cursor.is_none() {
                break;
            }

            if page == MAX_PAGES {
                debug!(feed = %feed.id, "Reached the page limit; older posts are deferred");
            }
        }

        Ok(items)
    }

    fn feed_ref(&self, feed: &str) -> FeedRef {
        FeedRef {
            id: feed.into(),
            name: format!("@{feed}"),
            url: join_segments(&self.profile_base, [feed]),
        }
    }
}

fn parse_author_feed(
    posts: Vec<FeedViewPost>,
    feed: &FeedRef,
    profile_base: &Url,
    since: OffsetDateTime,
) -> (Vec<Item>, bool) {
    let mut items = vec![];
    let mut reached_watermark = false;

    for (idx, FeedViewPost { post, reason }) in posts.into_iter().enumerate() {
        if let Some(reason) = reason {
            let reason = reason
                .get("$type")
                .and_then(|t| t.as_str())
                .unwrap_or("unknown");
            debug!(feed = %feed.id, uri = %post.uri, reason, "Skipping a repost or pinned post");
            continue;
        }

        match to_item(post, feed, profile_base) {
            Ok(item) if item.published <= since => reached_watermark = true,
            Ok(item) => items.push(item),

            Err(e) => {
                warn!(feed = %feed.id, "Skipping malformed post #{}: {e:#}", idx + 1);
            }
        }
    }

    (items, reached_watermark)
}

fn to_item(post: PostView, feed: &FeedRef, profile_base: &Url) -> Result<Item> {
    let rkey = post
        .uri
        .rsplit('/')
        .next()
        .filter(|rkey| !rkey.is_empty())
        .ok_or_else(|| anyhow!("the post URI `{}` has no record key", post.uri))?;
    let handle = post
        .author
        .as_ref()
        .map_or(feed.id.as_str(), |author| author.handle.as_str());
    let record: PostRecord =
        serde_json::from_value(post.record).context("the post record is malformed")?;
    let published = OffsetDateTime::parse(&record.created_at, &Rfc3339).with_context(|| {
        anyhow!("could not parse the creation date `{}`", record.created_at)
    })?;

    Ok(Item {
        title: truncate_title(&record.text),
        url: join_segments(profile_base, [handle, "post", rkey]),
        published,
        feed: feed.clone(),
        category: None,
        score: None,
        kind: None,
    })
}

fn truncate_title(text: &str) -> String {
    match text.char_indices().nth(MAX_TITLE_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    const SINCE: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    fn source() -> BlueskySource {
        BlueskySource::new(reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build())
            .unwrap()
    }

    fn post(rkey: &str, text: &str, created_at: &str) -> serde_json::Value {
        json!({
            "post": {
                "uri": format!("at://did:plc:abc/app.bsky.feed.post/{rkey}"),
                "cid": "bafy",
                "author": { "handle": "alice.bsky.social" },
                "record": {
                    "$type": "app.bsky.feed.post",
                    "text": text,
                    "createdAt": created_at,
                },
                "replyCount": 1,
                "likeCount": 2,
            }
        })
    }

    fn repost(rkey: &str, author: &str, text: &str, created_at: &str) -> serde_json::Value {
        let mut entry = post(rkey, text, created_at);
        entry["post"]["author"]["handle"] = json!(author);
        entry["reason"] = json!({
            "$type": "app.bsky.feed.defs#reasonRepost",
            "by": { "handle": "alice.bsky.social" },
            "indexedAt": "2024-01-02T09:00:00Z",
        });

        entry
    }

    fn parse(posts: serde_json::Value) -> (Vec<Item>, bool) {
        let source = source();
        let feed = source.feed_ref("alice.bsky.social");
        let response: AuthorFeed =
            serde_json::from_value(json!({ "feed": posts, "cursor": "next" })).unwrap();

        parse_author_feed(response.feed, &feed, &source.profile_base, SINCE)
    }

    #[test]
    fn posts_link_to_the_web_app() {
        let (items, reached_watermark) =
            parse(json!([post("3kabc", "Hello world", "2024-01-02T08:00:00.123Z")]));

        assert!(!reached_watermark);
        assert_eq!(items[0].title, "Hello world");
        assert_eq!(
            items[0].url.as_str(),
            "https://bsky.app/profile/alice.bsky.social/post/3kabc"
        );
        assert_eq!(items[0].feed.name, "@alice.bsky.social");
        assert_eq!(
            items[0].feed.url.as_str(),
            "https://bsky.app/profile/alice.bsky.social"
        );
    }

    #[test]
    fn old_and_malformed_posts_are_skipped() {
        let (items, reached_watermark) = parse(json!([
            post("new", "new post", "2024-01-01T12:00:01Z"),
            post("bad", "bad date", "last tuesday"),
            post("old", "old post", "2024-01-01T12:00:00Z"),
        ]));

        assert!(reached_watermark);
        assert_eq!(
            items.iter().map(|i| i.title.as_str()).collect::<Vec<_>>(),
            ["new post"]
        );
    }

    #[test]
    fn reposts_are_skipped_and_do_not_stop_paging() {
        let (items, reached_watermark) = parse(json!([
            repost("bobrkey", "bob.bsky.social", "bob old", "2023-06-01T00:00:00Z"),
            repost("carolrkey", "carol.bsky.social", "carol new", "2024-01-02T00:00:00Z"),
            post("own", "own post", "2024-01-02T10:00:00Z"),
        ]));

        assert!(!reached_watermark);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "own post");
        assert_eq!(
            items[0].url.as_str(),
            "https://bsky.app/profile/alice.bsky.social/post/own"
        );
    }

    #[test]
    fn post_links_use_the_author_handle() {
        let mut entry = post("3kxyz", "by did", "2024-01-02T10:00:00Z");
        entry["post"]["author"]["handle"] = json!("alice.example.com");
        let (items, _) = parse(json!([entry]));

        assert_eq!(
            items[0].url.as_str(),
            "https://bsky.app/profile/alice.example.com/post/3kxyz"
        );
    }

    #[test]
    fn long_text_is_truncated_on_char_boundaries() {
        let text = "é".repeat(150);
        let title = truncate_title(&text);

        assert_eq!(title.chars().count(), MAX_TITLE_CHARS + 3);
        assert!(title.ends_with("..."));
        assert_eq!(truncate_title("short"), "short");
        assert_eq!(truncate_title(&"a".repeat(100)), "a".repeat(100));
    }
}
