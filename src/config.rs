mod types;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lettre::message::Mailbox;
use serde::Deserialize;
use take_mut::take;
use thiserror::Error;
use tracing::{debug, info};

pub use self::types::*;

pub const ENV_PREFIX: &str = "MEDIA_MONITOR_";

const OVERRIDABLE_SECTIONS: &[&str] = &["reddit", "youtube", "bluesky", "smtp"];
const LIST_FIELDS: &[&str] = &["to", "subreddits", "channels", "users"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("`{section}` must specify either `{list_key}` or `categories`")]
    NoFeeds {
        section: &'static str,
        list_key: &'static str,
    },

    #[error("`{section}` must not specify both `{list_key}` and `categories`")]
    ConflictingFeedLists {
        section: &'static str,
        list_key: &'static str,
    },

    #[error("`{section}.categories` contains a category with an empty name")]
    EmptyCategoryName { section: &'static str },

    #[error("`{section}` lists the feed `{feed}` more than once")]
    DuplicateFeed { section: &'static str, feed: String },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub db_path: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub initial_lookback: Duration,
    pub source_timeout: Duration,
    pub timezone: Option<String>,

    pub reddit: RedditConfig,
    pub youtube: YouTubeConfig,
    pub bluesky: BlueskyConfig,
    pub smtp: SmtpConfig,
}

impl Config {
    pub fn update(&mut self, args: &crate::cli::Args) {
        fn set_if_some<T: Clone>(dst: &mut T, v: Option<&T>) {
            if let Some(v) = v {
                *dst = v.clone();
            }
        }

        set_if_some(&mut self.db_path, args.db_path.as_ref());

        if let Some(cache_dir) = &args.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        let config_dir = config_dir.as_ref();

        take(self, |this| Self {
            db_path: config_dir.join(&this.db_path),
            cache_dir: this.cache_dir.map(|cache_dir| config_dir.join(cache_dir)),
            initial_lookback: this.initial_lookback,
            source_timeout: this.source_timeout,
            timezone: this.timezone,
            reddit: this.reddit,
            youtube: this.youtube,
            bluesky: this.bluesky,
            smtp: this.smtp,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.timezone {
            if time_tz::timezones::get_by_name(name).is_none() {
                return Err(ConfigError::InvalidValue {
                    field: "timezone".into(),
                    reason: format!("unknown timezone `{name}`"),
                });
            }
        }

        if self.reddit.enabled {
            require("reddit.client-id", &self.reddit.client_id)?;
            require("reddit.client-secret", &self.reddit.client_secret)?;
            require("reddit.user-agent", &self.reddit.user_agent)?;
            self.reddit.feed_set()?;
        }

        if self.youtube.enabled {
            require("youtube.api-key", &self.youtube.api_key)?;
            self.youtube.feed_set()?;
        }

        if self.bluesky.enabled {
            self.bluesky.feed_set()?;
        }

        if self.smtp.enabled {
            self.smtp.validate()?;
        }

        info!("Configuration validation passed");

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: "./media-monitor.sqlite3".into(),
            cache_dir: None,
            initial_lookback: Duration::from_secs(72 * 3600),
            source_timeout: Duration::from_secs(300),
            timezone: None,
            reddit: Default::default(),
            youtube: Default::default(),
            bluesky: Default::default(),
            smtp: Default::default(),
        }
    }
}

fn require<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingField(field.into())),
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RedditConfig {
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_agent: Option<String>,
    pub subreddits: Option<Vec<String>>,
    pub categories: Option<Categories>,

    /// Minimum score a post needs to be reported, per subreddit.
    pub karma_filters: HashMap<String, i64>,
}

impl RedditConfig {
    pub fn feed_set(&self) -> Result<FeedSet, ConfigError> {
        let feeds = FeedSet::from_config(
            "reddit",
            "subreddits",
            self.subreddits.as_deref(),
            self.categories.as_ref(),
        )?;

        for subreddit in self.karma_filters.keys() {
            if !feeds.feeds().any(|feed| feed == subreddit) {
                return Err(ConfigError::InvalidValue {
                    field: "reddit.karma-filters".into(),
                    reason: format!("`{subreddit}` is not a configured subreddit"),
                });
            }
        }

        Ok(feeds)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct YouTubeConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub channels: Option<Vec<String>>,
    pub categories: Option<Categories>,
}

impl YouTubeConfig {
    pub fn feed_set(&self) -> Result<FeedSet, ConfigError> {
        FeedSet::from_config(
            "youtube",
            "channels",
            self.channels.as_deref(),
            self.categories.as_ref(),
        )
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BlueskyConfig {
    pub enabled: bool,
    pub users: Option<Vec<String>>,
    pub categories: Option<Categories>,
}

impl BlueskyConfig {
    pub fn feed_set(&self) -> Result<FeedSet, ConfigError> {
        FeedSet::from_config(
            "bluesky",
            "users",
            self.users.as_deref(),
            self.categories.as_ref(),
        )
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub send_empty_report: bool,
}

impl SmtpConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require("smtp.server", &self.server)?;
        self.port
            .ok_or_else(|| ConfigError::MissingField("smtp.port".into()))?;
        require("smtp.username", &self.username)?;
        require("smtp.password", &self.password)?;
        let from = require("smtp.from", &self.from)?;

        if self.to.is_empty() {
            return Err(ConfigError::MissingField("smtp.to".into()));
        }

        for (field, addr) in
            std::iter::once(("smtp.from", from)).chain(self.to.iter().map(|to| ("smtp.to", &**to)))
        {
            addr.parse::<Mailbox>()
                .map_err(|e| ConfigError::InvalidValue {
                    field: field.into(),
                    reason: format!("`{addr}` is not a valid address: {e}"),
                })?;
        }

        Ok(())
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            enabled: false,
            server: None,
            port: None,
            username: None,
            password: None,
            from: None,
            to: vec![],
            subject: "Media Monitor Report".into(),
            send_empty_report: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub category: Option<String>,
    pub feed: String,
}

/// The configured feeds of one source in configuration order.
///
/// A flat feed list becomes a single uncategorized group, so both configuration shapes look the
/// same to everything downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSet {
    entries: Vec<FeedEntry>,
}

impl FeedSet {
    pub fn from_config(
        section: &'static str,
        list_key: &'static str,
        list: Option<&[String]>,
        categories: Option<&Categories>,
    ) -> Result<Self, ConfigError> {
        let mut entries = vec![];

        match (list, categories) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ConflictingFeedLists { section, list_key });
            }

            (Some(list), None) => {
                for feed in list {
                    entries.push(FeedEntry {
                        category: None,
                        feed: feed.trim().to_owned(),
                    });
                }
            }

            (None, Some(categories)) => {
                for (name, feeds) in &categories.0 {
                    let name = name.trim();

                    if name.is_empty() {
                        return Err(ConfigError::EmptyCategoryName { section });
                    }

                    for feed in feeds {
                        entries.push(FeedEntry {
                            category: Some(name.to_owned()),
                            feed: feed.trim().to_owned(),
                        });
                    }
                }
            }

            (None, None) => {}
        }

        entries.retain(|entry| !entry.feed.is_empty());

        if entries.is_empty() {
            return Err(ConfigError::NoFeeds { section, list_key });
        }

        let mut seen = HashSet::with_capacity(entries.len());

        for entry in &entries {
            if !seen.insert(entry.feed.as_str()) {
                return Err(ConfigError::DuplicateFeed {
                    section,
                    feed: entry.feed.clone(),
                });
            }
        }

        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter()
    }

    pub fn feeds(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.feed.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<FeedEntry> for FeedSet {
    fn from_iter<I: IntoIterator<Item = FeedEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Applies `MEDIA_MONITOR_<SECTION>_<FIELD>` overrides to a parsed config document.
pub fn apply_env_overrides(
    doc: &mut toml::Table,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<(), ConfigError> {
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let rest = rest.to_lowercase();
        let Some((section, field)) = rest.split_once('_') else {
            continue;
        };

        if !OVERRIDABLE_SECTIONS.contains(&section) || field.is_empty() {
            continue;
        }

        let field = field.replace('_', "-");
        let value = coerce_env_value(&key, &field, &value)?;

        let section_table = doc
            .entry(section)
            .or_insert_with(|| toml::Value::Table(Default::default()));
        let toml::Value::Table(section_table) = section_table else {
            return Err(ConfigError::InvalidValue {
                field: section.into(),
                reason: "expected a table".into(),
            });
        };

        section_table.insert(field.clone(), value);
        info!("Applied environment override: {section}.{field}");
    }

    Ok(())
}

fn coerce_env_value(key: &str, field: &str, value: &str) -> Result<toml::Value, ConfigError> {
    Ok(match field {
        "enabled" | "send-empty-report" => toml::Value::Boolean(matches!(
            value.trim().to_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        )),

        "port" => toml::Value::Integer(value.trim().parse::<i64>().map_err(|e| {
            ConfigError::InvalidValue {
                field: key.into(),
                reason: format!("`{value}` is not an integer: {e}"),
            }
        })?),

        field if LIST_FIELDS.contains(&field) => toml::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.into()))
                .collect(),
        ),

        _ => toml::Value::String(value.into()),
    })
}

pub fn load(
    search_paths: &[PathBuf],
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<Config> {
    let mut doc = toml::Table::new();
    let mut config_dir = None;

    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not load a config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of a config file `{}`",
                    path.display()
                )
            })?;
        }

        doc = contents
            .parse::<toml::Table>()
            .with_context(|| anyhow!("could not parse the config file `{}`", path.display()))?;
        config_dir = path.parent().map(Path::to_path_buf);
        info!("Loaded a config file `{}`", path.display());

        break;
    }

    if config_dir.is_none() {
        info!("No config file found; using the default config");
    }

    apply_env_overrides(&mut doc, env).context("could not apply environment overrides")?;

    let mut cfg: Config = toml::Value::Table(doc)
        .try_into()
        .context("the configuration is malformed")?;

    if let Some(config_dir) = config_dir {
        cfg.resolve_relative_paths(config_dir);
    }

    Ok(cfg)
}
