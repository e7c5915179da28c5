use clap::ValueHint;

use std::path::PathBuf;

/// Polls the configured sources once and emails a report of the new items.
#[derive(clap::Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to the config file.
    ///
    /// By default, media-monitor looks for a file named `media-monitor.toml` in the following
    /// directories (in order):
    ///
    /// - `./` (the current directory)
    /// - `/etc`
    #[arg(
        short,
        long = "config",
        env = "MEDIA_MONITOR_CONFIG",
        value_hint(ValueHint::FilePath)
    )]
    pub config_path: Option<PathBuf>,

    /// Path to the watermark database file.
    #[arg(long, env = "MEDIA_MONITOR_DB", value_hint(ValueHint::FilePath))]
    pub db_path: Option<PathBuf>,

    /// Path to the HTTP cache directory.
    #[arg(long, env = "MEDIA_MONITOR_CACHE_DIR", value_hint(ValueHint::DirPath))]
    pub cache_dir: Option<PathBuf>,

    /// Print the plain-text report to stdout instead of emailing it.
    ///
    /// Watermarks are still advanced.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the stored watermarks and exit without polling.
    #[arg(long)]
    pub show_watermarks: bool,
}

impl Args {
    pub fn parse() -> Self {
        clap::Parser::parse()
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "media-monitor",
            "-c",
            "/srv/monitor.toml",
            "--db-path",
            "state.sqlite3",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(args.config_path, Some("/srv/monitor.toml".into()));
        assert_eq!(args.db_path, Some("state.sqlite3".into()));
        assert!(args.dry_run);
        assert!(!args.show_watermarks);
    }
}
