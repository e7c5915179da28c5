mod bluesky;
mod reddit;
mod youtube;

use std::fmt::{self, Display};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Url;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::FeedSet;

pub use self::bluesky::BlueskySource;
pub use self::reddit::RedditSource;
pub use self::youtube::YouTubeSource;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    Reddit,
    YouTube,
    Bluesky,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Reddit, Self::YouTube, Self::Bluesky];

    /// The key under which the source's watermark is stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reddit => "reddit",
            Self::YouTube => "youtube",
            Self::Bluesky => "bluesky",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Reddit => "Reddit",
            Self::YouTube => "YouTube",
            Self::Bluesky => "Bluesky",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// A single feed within a source: a subreddit, a channel, or an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRef {
    pub id: String,
    pub name: String,
    pub url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostKind {
    Discussion,

    ExternalLink {
        external_url: Url,
        discussion_url: Url,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub title: String,
    pub url: Url,
    pub published: OffsetDateTime,
    pub feed: FeedRef,
    pub category: Option<String>,
    pub score: Option<i64>,
    pub kind: Option<PostKind>,
}

#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Runs once per poll before any feed is fetched. Failing here fails the whole source.
    async fn prepare(&mut self, _feeds: &[&str]) -> Result<()> {
        Ok(())
    }

    /// Fetches the items of one feed published after `since`. The result may still contain
    /// items at or before `since`; those are filtered out by [`Source::fetch_since`].
    async fn fetch_feed(&self, feed: &FeedRef, since: OffsetDateTime) -> Result<Vec<Item>>;

    fn feed_ref(&self, feed: &str) -> FeedRef;

    /// Returns the items of all configured feeds that are strictly newer than `watermark`.
    ///
    /// A feed that cannot be fetched is skipped. The call only fails if the source cannot be
    /// prepared or if every feed failed.
    async fn fetch_since(
        &mut self,
        watermark: OffsetDateTime,
        feeds: &FeedSet,
    ) -> Result<Vec<Item>> {
        let kind = self.kind();

        if feeds.is_empty() {
            debug!(%kind, "No feeds to poll");
            return Ok(vec![]);
        }

        let feed_ids = feeds.feeds().collect::<Vec<_>>();

        self.prepare(&feed_ids).await?;

        let mut items = vec![];
        let mut failures = 0;

        for entry in feeds.iter() {
            let feed = self.feed_ref(&entry.feed);

            let fetched = match self.fetch_feed(&feed, watermark).await {
                Ok(fetched) => fetched,

                Err(e) => {
                    warn!(%kind, feed = %entry.feed, "Could not fetch the feed: {e:#}");
                    failures += 1;
                    continue;
                }
            };

            let total = fetched.len();
            let before = items.len();

            items.extend(
                fetched
                    .into_iter()
                    .filter(|item| item.published > watermark)
                    .map(|item| Item {
                        category: entry.category.clone(),
                        ..item
                    }),
            );

            debug!(
                %kind, feed = %entry.feed,
                "Kept {} of {total} fetched items",
                items.len() - before,
            );
        }

        if failures == feeds.len() {
            bail!("all {failures} feeds of {kind} failed");
        }

        info!(%kind, "Found {} new items since {watermark}", items.len());

        Ok(items)
    }
}

pub(crate) fn parse_url(s: &str) -> Result<Url> {
    Url::parse(s).map_err(|e| anyhow!("could not parse the URL `{s}`: {e}"))
}

/// Appends percent-encoded path segments to `base`.
pub(crate) fn join_segments<'a>(base: &Url, segments: impl IntoIterator<Item = &'a str>) -> Url {
    let mut url = base.clone();

    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }

    url
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use anyhow::anyhow;
    use time::macros::datetime;

    use super::*;

    pub const T0: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    pub fn item(feed: &str, title: &str, published: OffsetDateTime) -> Item {
        Item {
            title: title.into(),
            url: Url::parse(&format!("https://forum.example/{feed}/{}", title.replace(' ', "-")))
                .unwrap(),
            published,
            feed: fake_feed_ref(feed),
            category: None,
            score: None,
            kind: None,
        }
    }

    pub fn fake_feed_ref(feed: &str) -> FeedRef {
        FeedRef {
            id: feed.into(),
            name: feed.into(),
            url: Url::parse(&format!("https://forum.example/{feed}/")).unwrap(),
        }
    }

    /// A source backed by canned per-feed responses. Feeds missing from the map fail.
    pub struct FakeSource {
        pub kind: SourceKind,
        pub responses: HashMap<String, Vec<Item>>,
        pub fail_prepare: bool,
        pub prepared_with: Vec<Vec<String>>,
    }

    impl FakeSource {
        pub fn new(kind: SourceKind) -> Self {
            Self {
                kind,
                responses: HashMap::new(),
                fail_prepare: false,
                prepared_with: vec![],
            }
        }

        pub fn with_feed(mut self, feed: &str, items: Vec<Item>) -> Self {
            self.responses.insert(feed.into(), items);
            self
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn prepare(&mut self, feeds: &[&str]) -> Result<()> {
            self.prepared_with
                .push(feeds.iter().map(|s| s.to_string()).collect());

            if self.fail_prepare {
                return Err(anyhow!("authentication failed"));
            }

            Ok(())
        }

        async fn fetch_feed(&self, feed: &FeedRef, _since: OffsetDateTime) -> Result<Vec<Item>> {
            self.responses
                .get(&feed.id)
                .cloned()
                .ok_or_else(|| anyhow!("connection reset while fetching `{}`", feed.id))
        }

        fn feed_ref(&self, feed: &str) -> FeedRef {
            fake_feed_ref(feed)
        }
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::testing::*;
    use super::*;
    use crate::config::{Categories, FeedEntry};

    fn flat(feeds: &[&str]) -> FeedSet {
        feeds
            .iter()
            .map(|feed| FeedEntry {
                category: None,
                feed: feed.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn items_at_or_before_the_watermark_are_dropped() {
        let mut source = FakeSource::new(SourceKind::Reddit).with_feed(
            "alpha",
            vec![
                item("alpha", "old", T0 - Duration::hours(1)),
                item("alpha", "boundary", T0),
                item("alpha", "new", T0 + Duration::seconds(1)),
            ],
        );

        let items = source.fetch_since(T0, &flat(&["alpha"])).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "new");
        assert!(items.iter().all(|item| item.published > T0));
    }

    #[tokio::test]
    async fn failing_feed_is_skipped() {
        let mut source = FakeSource::new(SourceKind::Bluesky)
            .with_feed("alpha", vec![item("alpha", "A", T0 + Duration::minutes(1))])
            .with_feed("gamma", vec![item("gamma", "G", T0 + Duration::minutes(2))]);

        let items = source
            .fetch_since(T0, &flat(&["alpha", "beta", "gamma"]))
            .await
            .unwrap();

        let titles = items.iter().map(|i| i.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, ["A", "G"]);
    }

    #[tokio::test]
    async fn all_feeds_failing_fails_the_source() {
        let mut source = FakeSource::new(SourceKind::YouTube);

        assert!(source.fetch_since(T0, &flat(&["a", "b"])).await.is_err());
    }

    #[tokio::test]
    async fn prepare_failure_fails_the_source() {
        let mut source = FakeSource::new(SourceKind::Reddit)
            .with_feed("alpha", vec![item("alpha", "A", T0 + Duration::minutes(1))]);
        source.fail_prepare = true;

        assert!(source.fetch_since(T0, &flat(&["alpha"])).await.is_err());
    }

    #[tokio::test]
    async fn prepare_sees_every_feed_once() {
        let mut source = FakeSource::new(SourceKind::YouTube)
            .with_feed("UC1", vec![])
            .with_feed("UC2", vec![]);

        source.fetch_since(T0, &flat(&["UC1", "UC2"])).await.unwrap();

        assert_eq!(source.prepared_with, [vec!["UC1".to_string(), "UC2".into()]]);
    }

    #[tokio::test]
    async fn categories_are_applied_per_feed() {
        let feeds = FeedSet::from_config(
            "reddit",
            "subreddits",
            None,
            Some(&Categories(vec![
                ("news".into(), vec!["alpha".into()]),
                ("tech".into(), vec!["beta".into()]),
            ])),
        )
        .unwrap();
        let mut source = FakeSource::new(SourceKind::Reddit)
            .with_feed("alpha", vec![item("alpha", "A", T0 + Duration::minutes(1))])
            .with_feed("beta", vec![item("beta", "B", T0 + Duration::minutes(1))]);

        let items = source.fetch_since(T0, &feeds).await.unwrap();

        assert_eq!(items[0].category.as_deref(), Some("news"));
        assert_eq!(items[1].category.as_deref(), Some("tech"));
    }

    #[test]
    fn joined_segments_are_encoded() {
        let base = Url::parse("https://www.reddit.com/r/").unwrap();
        assert_eq!(
            join_segments(&base, ["rust", ""]).as_str(),
            "https://www.reddit.com/r/rust/"
        );

        let base = Url::parse("https://bsky.app/profile").unwrap();
        assert_eq!(
            join_segments(&base, ["a b"]).as_str(),
            "https://bsky.app/profile/a%20b"
        );
    }
}
