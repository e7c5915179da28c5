use std::sync::Arc;

use anyhow::{anyhow, Result};
use time::OffsetDateTime;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::FeedSet;
use crate::report::{QuietFeed, Report, SourceReport};
use crate::source::{Source, SourceKind};
use crate::storage::{Storage, BEGINNING_OF_TIME};

/// An enabled source together with the feeds it should poll.
pub struct PollTarget {
    pub source: Box<dyn Source>,
    pub feeds: FeedSet,
}

pub struct Aggregator {
    storage: Arc<Storage>,
    initial_lookback: time::Duration,
    source_timeout: std::time::Duration,
}

impl Aggregator {
    pub fn new(
        storage: Arc<Storage>,
        initial_lookback: time::Duration,
        source_timeout: std::time::Duration,
    ) -> Self {
        Self {
            storage,
            initial_lookback,
            source_timeout,
        }
    }

    /// Polls every target in order and collects the results into a report.
    ///
    /// Never fails: a source that cannot be polled is reported with no items and keeps its
    /// watermark, so its items are retried on the next run.
    pub async fn run(&self, targets: Vec<PollTarget>) -> Report {
        let generated_at = OffsetDateTime::now_utc();
        let mut sources = Vec::with_capacity(targets.len());

        for target in targets {
            let kind = target.source.kind();
            let report = self
                .poll(target)
                .instrument(info_span!("source", source = %kind))
                .await;
            sources.push(report);
        }

        Report {
            generated_at,
            sources,
        }
    }

    async fn poll(&self, target: PollTarget) -> SourceReport {
        let PollTarget { mut source, feeds } = target;
        let kind = source.kind();
        let started_at = OffsetDateTime::now_utc();

        let watermark = match self.watermark(kind, started_at).await {
            Ok(watermark) => watermark,

            Err(e) => {
                error!("Could not read the watermark: {e:#}");
                return SourceReport::failed(kind);
            }
        };

        let fetch = source.fetch_since(watermark, &feeds);
        let result = tokio::time::timeout(self.source_timeout, fetch)
            .await
            .unwrap_or_else(|_| {
                Err(anyhow!(
                    "the poll did not finish within {}s",
                    self.source_timeout.as_secs()
                ))
            });

        let items = match result {
            Ok(items) => items,

            Err(e) => {
                error!("Could not poll the source; keeping the watermark at {watermark}: {e:#}");
                return SourceReport::failed(kind);
            }
        };

        match self.storage.set_watermark(kind.as_str(), started_at).await {
            Ok(()) => info!("Advanced the watermark to {started_at}"),
            Err(e) => warn!("Could not advance the watermark; it stays at {watermark}: {e:#}"),
        }

        let quiet_feeds = feeds
            .iter()
            .filter(|entry| !items.iter().any(|item| item.feed.id == entry.feed))
            .map(|entry| QuietFeed {
                category: entry.category.clone(),
                feed: source.feed_ref(&entry.feed),
            })
            .collect();

        SourceReport {
            kind,
            items,
            quiet_feeds,
            failed: false,
        }
    }

    /// A source that was never polled starts `initial_lookback` before `now`.
    async fn watermark(&self, kind: SourceKind, now: OffsetDateTime) -> Result<OffsetDateTime> {
        let stored = self.storage.watermark_or_default(kind.as_str()).await?;

        if stored != BEGINNING_OF_TIME {
            return Ok(stored);
        }

        let watermark = now
            .checked_sub(self.initial_lookback)
            .unwrap_or(BEGINNING_OF_TIME)
            .max(BEGINNING_OF_TIME);
        info!("No stored watermark; looking back to {watermark}");

        Ok(watermark)
    }
}
