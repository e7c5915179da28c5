use std::fmt::{self, Write};

use anyhow::{anyhow, Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use time_tz::{OffsetDateTimeExt, TimeZone, Tz};

use crate::source::{FeedRef, Item, PostKind, SourceKind};
use crate::template::Template;

pub const NO_ITEMS_MESSAGE: &str = "No new items found from any source.";
const NO_FEED_ITEMS_MESSAGE: &str = "No new items for this feed.";
const UNCATEGORIZED: &str = "Uncategorized";

/// A configured feed that contributed no items in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuietFeed {
    pub category: Option<String>,
    pub feed: FeedRef,
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub kind: SourceKind,
    pub items: Vec<Item>,
    pub quiet_feeds: Vec<QuietFeed>,
    pub failed: bool,
}

impl SourceReport {
    pub fn failed(kind: SourceKind) -> Self {
        Self {
            kind,
            items: vec![],
            quiet_feeds: vec![],
            failed: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub generated_at: OffsetDateTime,
    pub sources: Vec<SourceReport>,
}

impl Report {
    pub fn has_items(&self) -> bool {
        self.sources.iter().any(|source| !source.items.is_empty())
    }

    pub fn item_count(&self) -> usize {
        self.sources.iter().map(|source| source.items.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub text: String,
    pub html: String,
}

#[derive(Serialize, Debug, Clone)]
struct ReportView {
    subject: String,
    generated_at: String,
    has_items: bool,
    no_items_message: &'static str,
    sources: Vec<SourceView>,
}

#[derive(Serialize, Debug, Clone)]
struct SourceView {
    name: &'static str,
    has_items: bool,
    categories: Vec<CategoryView>,
}

#[derive(Serialize, Debug, Clone)]
struct CategoryView {
    heading: Option<String>,
    feeds: Vec<FeedView>,
}

#[derive(Serialize, Debug, Clone)]
struct FeedView {
    name: String,
    url: String,
    items: Vec<ItemView>,
}

#[derive(Serialize, Debug, Clone)]
struct ItemView {
    title: String,
    url: String,
    score: Option<String>,
    external_url: Option<String>,
    discussion_url: Option<String>,
}

pub struct Renderer<'a> {
    templates: &'a Handlebars<'static>,
    subject: String,
    timezone: Option<&'static Tz>,
}

impl<'a> Renderer<'a> {
    pub fn new(
        templates: &'a Handlebars<'static>,
        subject: impl Into<String>,
        timezone: Option<&'static Tz>,
    ) -> Self {
        Self {
            templates,
            subject: subject.into(),
            timezone,
        }
    }

    /// Renders the report as plain text and as HTML. Both share one grouped view, so they always
    /// list the same items in the same order.
    pub fn render(&self, report: &Report) -> Result<RenderedReport> {
        let view = ReportView {
            subject: self.subject.clone(),
            generated_at: format_timestamp(report.generated_at, self.timezone)?,
            has_items: report.has_items(),
            no_items_message: NO_ITEMS_MESSAGE,
            sources: report.sources.iter().map(source_view).collect(),
        };

        let html = self
            .templates
            .render(Template::Report.as_str(), &view)
            .context("could not render the HTML report")?;
        let text = render_text(&view)?;

        Ok(RenderedReport { text, html })
    }
}

fn source_view(source: &SourceReport) -> SourceView {
    let mut groups: Vec<(Option<&str>, Vec<(&FeedRef, Vec<&Item>)>)> = vec![];

    fn group_index<'r, T>(
        groups: &mut Vec<(Option<&'r str>, Vec<T>)>,
        category: Option<&'r str>,
    ) -> usize {
        match groups.iter().position(|(c, _)| *c == category) {
            Some(idx) => idx,

            None => {
                groups.push((category, vec![]));
                groups.len() - 1
            }
        }
    }

    for item in &source.items {
        let idx = group_index(&mut groups, item.category.as_deref());
        let feeds = &mut groups[idx].1;

        match feeds.iter_mut().find(|(feed, _)| feed.id == item.feed.id) {
            Some((_, items)) => items.push(item),
            None => feeds.push((&item.feed, vec![item])),
        }
    }

    if !source.items.is_empty() {
        for quiet in &source.quiet_feeds {
            let idx = group_index(&mut groups, quiet.category.as_deref());
            let feeds = &mut groups[idx].1;

            if !feeds.iter().any(|(feed, _)| feed.id == quiet.feed.id) {
                feeds.push((&quiet.feed, vec![]));
            }
        }
    }

    let show_headings = groups.len() > 1;

    SourceView {
        name: source.kind.display_name(),
        has_items: !source.items.is_empty(),
        categories: groups
            .into_iter()
            .map(|(category, feeds)| CategoryView {
                heading: show_headings
                    .then(|| category.map(title_case).unwrap_or_else(|| UNCATEGORIZED.into())),
                feeds: feeds
                    .into_iter()
                    .map(|(feed, items)| FeedView {
                        name: feed.name.clone(),
                        url: feed.url.to_string(),
                        items: items.into_iter().map(item_view).collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn item_view(item: &Item) -> ItemView {
    let (external_url, discussion_url) = match &item.kind {
        Some(PostKind::ExternalLink {
            external_url,
            discussion_url,
        }) => (Some(external_url.to_string()), Some(discussion_url.to_string())),

        Some(PostKind::Discussion) | None => (None, None),
    };

    ItemView {
        title: item.title.clone(),
        url: item.url.to_string(),
        score: item.score.map(|score| match score {
            1 => "1 point".to_owned(),
            n => format!("{n} points"),
        }),
        external_url,
        discussion_url,
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();

            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_text(view: &ReportView) -> Result<String> {
    let mut out = String::new();
    write_text(&mut out, view).context("could not render the text report")?;

    Ok(out)
}

fn write_text(out: &mut String, view: &ReportView) -> fmt::Result {
    if !view.has_items {
        return writeln!(out, "{}", view.no_items_message);
    }

    writeln!(out, "{}\nGenerated {}", view.subject, view.generated_at)?;

    for source in &view.sources {
        let underline = "=".repeat(source.name.chars().count());
        write!(out, "\n{}\n{underline}\n", source.name)?;

        if !source.has_items {
            writeln!(out, "No new items from {}.", source.name)?;
            continue;
        }

        for category in &source.categories {
            if let Some(heading) = &category.heading {
                writeln!(out, "\n## {heading}")?;
            }

            for feed in &category.feeds {
                writeln!(out, "\n{} <{}>", feed.name, feed.url)?;

                if feed.items.is_empty() {
                    writeln!(out, "  {NO_FEED_ITEMS_MESSAGE}")?;
                }

                for item in &feed.items {
                    match &item.score {
                        Some(score) => writeln!(out, "  - {} ({score})", item.title)?,
                        None => writeln!(out, "  - {}", item.title)?,
                    }

                    match (&item.external_url, &item.discussion_url) {
                        (Some(external_url), Some(discussion_url)) => writeln!(
                            out,
                            "    Link: {external_url}\n    Discussion: {discussion_url}"
                        )?,

                        _ => writeln!(out, "    {}", item.url)?,
                    }
                }
            }
        }
    }

    Ok(())
}

fn format_timestamp(ts: OffsetDateTime, timezone: Option<&'static Tz>) -> Result<String> {
    static FORMAT: &[BorrowedFormatItem<'_>] = format_description!(
        "[month repr:long] [day padding:none], [year] at \
            [hour repr:12 padding:none]:[minute] [period] \
            [offset_hour sign:mandatory]:[offset_minute]"
    );

    let (ts, zone_name) = match timezone {
        Some(tz) => (ts.to_timezone(tz), tz.name()),
        None => (ts.to_offset(time::UtcOffset::UTC), "UTC"),
    };

    let formatted = ts
        .format(FORMAT)
        .with_context(|| anyhow!("could not format the date {ts}"))?;

    Ok(format!("{formatted} ({zone_name})"))
}
