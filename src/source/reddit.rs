use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::RedditConfig;
use crate::fetch::get_json;

use super::{join_segments, parse_url, FeedRef, Item, PostKind, Source, SourceKind};

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com/r/";
const WEB_BASE: &str = "https://www.reddit.com/r/";
const PERMALINK_BASE: &str = "https://www.reddit.com";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: usize = 3;

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize, Debug)]
struct Listing {
    data: ListingData,
}

#[derive(Deserialize, Debug)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
    after: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Child {
    data: Submission,
}

#[derive(Deserialize, Debug)]
struct Submission {
    id: String,
    title: String,
    url: String,
    permalink: String,
    created_utc: f64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    is_self: bool,
}

pub struct RedditSource {
    http_client: ClientWithMiddleware,
    client_id: String,
    client_secret: String,
    user_agent: String,
    access_token: Option<String>,
    karma_filters: HashMap<String, i64>,
    api_base: Url,
    web_base: Url,
}

impl RedditSource {
    pub fn new(http_client: ClientWithMiddleware, cfg: &RedditConfig) -> Result<Self> {
        let field = |v: &Option<String>, name: &str| {
            v.clone()
                .ok_or_else(|| anyhow!("missing required field `reddit.{name}`"))
        };

        Ok(Self {
            http_client,
            client_id: field(&cfg.client_id, "client-id")?,
            client_secret: field(&cfg.client_secret, "client-secret")?,
            user_agent: field(&cfg.user_agent, "user-agent")?,
            access_token: None,
            karma_filters: cfg.karma_filters.clone(),
            api_base: parse_url(API_BASE)?,
            web_base: parse_url(WEB_BASE)?,
        })
    }
}

#[async_trait]
impl Source for RedditSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Reddit
    }

    async fn prepare(&mut self, _feeds: &[&str]) -> Result<()> {
        let request = self
            .http_client
            .post(TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .form(&[("grant_type", "client_credentials")]);
        let token: TokenResponse = get_json(request, "a Reddit access token")
            .await
            .context("could not authenticate with Reddit")?;
        debug!("Obtained a Reddit access token");
        self.access_token = Some(token.access_token);

        Ok(())
    }

    async fn fetch_feed(&self, feed: &FeedRef, since: OffsetDateTime) -> Result<Vec<Item>> {
        let token = self
            .access_token
            .as_deref()
            .context("the Reddit source was not prepared")?;
        let url = join_segments(&self.api_base, [feed.id.as_str(), "new"]);
        let limit = PAGE_SIZE.to_string();
        let min_score = self.karma_filters.get(&feed.id).copied();
        let mut after: Option<String> = None;
        let mut items = vec![];

        for page in 1..=MAX_PAGES {
            let mut query = vec![("limit", limit.as_str()), ("raw_json", "1")];

            if let Some(after) = &after {
                query.push(("after", after.as_str()));
            }

            let request = self
                .http_client
                .get(url.clone())
                .bearer_auth(token)
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .query(&query);
            let listing: Listing =
                get_json(request, &format!("page {page} of r/{}", feed.id)).await?;

            let (page_items, reached_watermark) =
                parse_listing(listing.data.children, feed, since, min_score);
            items.extend(page_items);

            after = listing.data.after;

            if reached_watermark || after.is_none() {
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
            name: format!("r/{feed}"),
            url: join_segments(&self.web_base, [feed, ""]),
        }
    }
}

/// Converts one listing page. Also reports whether the page reached posts at or before `since`,
/// in which case there is no point in requesting the next page.
///
/// Posts scoring below `min_score` are dropped.
fn parse_listing(
    children: Vec<Child>,
    feed: &FeedRef,
    since: OffsetDateTime,
    min_score: Option<i64>,
) -> (Vec<Item>, bool) {
    let mut items = Vec::with_capacity(children.len());
    let mut reached_watermark = false;

    for Child { data: post } in children {
        let Ok(published) = OffsetDateTime::from_unix_timestamp(post.created_utc as i64) else {
            warn!(feed = %feed.id, id = %post.id, "Skipping a post with an invalid timestamp");
            continue;
        };

        if published <= since {
            reached_watermark = true;
            continue;
        }

        if min_score.is_some_and(|min_score| post.score < min_score) {
            debug!(feed = %feed.id, id = %post.id, score = post.score, "Skipping a low-score post");
            continue;
        }

        match to_item(post, published, feed) {
            Ok(item) => items.push(item),
            Err(e) => warn!(feed = %feed.id, "Skipping a malformed post: {e:#}"),
        }
    }

    (items, reached_watermark)
}

fn to_item(post: Submission, published: OffsetDateTime, feed: &FeedRef) -> Result<Item> {
    let discussion_url = parse_url(&format!("{PERMALINK_BASE}{}", post.permalink))?;

    let (url, kind) = if post.is_self {
        (discussion_url, PostKind::Discussion)
    } else {
        let external_url = parse_url(&post.url)?;

        (
            external_url.clone(),
            PostKind::ExternalLink {
                external_url,
                discussion_url,
            },
        )
    };

    Ok(Item {
        title: post.title,
        url,
        published,
        feed: feed.clone(),
        category: None,
        score: Some(post.score),
        kind: Some(kind),
    })
}
