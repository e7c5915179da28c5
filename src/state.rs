use std::sync::Arc;

use anyhow::Result;
use handlebars::Handlebars;
use reqwest_middleware::ClientWithMiddleware;
use time_tz::Tz;
use tracing::debug;

use crate::aggregator::PollTarget;
use crate::config::Config;
use crate::fetch;
use crate::source::{BlueskySource, RedditSource, SourceKind, YouTubeSource};
use crate::storage::Storage;
use crate::template;

#[derive(Clone)]
pub struct State {
    pub storage: Arc<Storage>,
    pub cfg: Arc<Config>,
    pub template: Arc<Handlebars<'static>>,
    pub http_client: ClientWithMiddleware,
}

impl State {
    pub async fn new(cfg: Config) -> Result<Self> {
        let storage = Arc::new(Storage::new(&cfg.db_path).await?);
        let template = Arc::new(template::new()?);
        let http_client = fetch::http_client(cfg.cache_dir.clone())?;
        let cfg = Arc::new(cfg);

        Ok(State {
            storage,
            cfg,
            template,
            http_client,
        })
    }

    pub fn timezone(&self) -> Option<&'static Tz> {
        self.cfg
            .timezone
            .as_deref()
            .and_then(time_tz::timezones::get_by_name)
    }

    /// Builds the enabled sources in report order. Disabled sources are never constructed.
    pub fn poll_targets(&self) -> Result<Vec<PollTarget>> {
        let cfg = &self.cfg;
        let mut targets = vec![];

        for kind in SourceKind::ALL {
            let target = match kind {
                SourceKind::Reddit if cfg.reddit.enabled => PollTarget {
                    source: Box::new(RedditSource::new(self.http_client.clone(), &cfg.reddit)?),
                    feeds: cfg.reddit.feed_set()?,
                },

                SourceKind::YouTube if cfg.youtube.enabled => PollTarget {
                    source: Box::new(YouTubeSource::new(self.http_client.clone(), &cfg.youtube)?),
                    feeds: cfg.youtube.feed_set()?,
                },

                SourceKind::Bluesky if cfg.bluesky.enabled => PollTarget {
                    source: Box::new(BlueskySource::new(self.http_client.clone())?),
                    feeds: cfg.bluesky.feed_set()?,
                },

                _ => {
                    debug!(%kind, "Skipping a disabled source");
                    continue;
                }
            };

            targets.push(target);
        }

        Ok(targets)
    }
}
