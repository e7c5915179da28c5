mod aggregator;
mod cli;
mod config;
mod delivery;
mod fetch;
mod report;
mod source;
mod state;
mod storage;
mod template;

use std::process::ExitCode;

use aggregator::Aggregator;
use anyhow::{anyhow, Context, Result};
use cli::Args;
use delivery::{RetryPolicy, SmtpTransport};
use report::Renderer;
use state::State;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_regex(false)
                .with_default_directive(Level::INFO.into())
                .with_env_var("MEDIA_MONITOR_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    set_up_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,

        Err(e) => {
            error!("{e:#}");

            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let mut args = Args::parse();
    let config_paths = args
        .config_path
        .take()
        .into_iter()
        .chain([
            "./media-monitor.toml".into(),
            "/etc/media-monitor.toml".into(),
        ])
        .collect::<Vec<_>>();
    let mut config = config::load(&config_paths, std::env::vars())?;
    config.update(&args);
    config.validate().context("the configuration is invalid")?;
    let state = State::new(config).await?;

    if args.show_watermarks {
        return show_watermarks(&state).await;
    }

    // a broken mail setup must fail the run before any watermark moves
    let transport = if state.cfg.smtp.enabled && !args.dry_run {
        Some(SmtpTransport::new(&state.cfg.smtp)?)
    } else {
        None
    };

    let aggregator = Aggregator::new(
        state.storage.clone(),
        state.cfg.initial_lookback.into(),
        state.cfg.source_timeout.into(),
    );
    let report = aggregator.run(state.poll_targets()?).await;
    info!(
        "Collected {} new items from {} sources ({} failed)",
        report.item_count(),
        report.sources.len(),
        report.sources.iter().filter(|source| source.failed).count(),
    );

    let rendered = Renderer::new(&state.template, &state.cfg.smtp.subject, state.timezone())
        .render(&report)?;

    if args.dry_run {
        print!("{}", rendered.text);

        return Ok(());
    }

    let Some(transport) = transport else {
        info!("Email delivery is disabled; the report was not sent");

        return Ok(());
    };

    // the watermarks stay advanced either way
    let policy = RetryPolicy::default();
    let sent = delivery::send_report(&transport, &state.cfg.smtp, &report, rendered, &policy);

    if let Err(e) = sent.await {
        error!("Could not deliver the report: {e}");
    }

    Ok(())
}

async fn show_watermarks(state: &State) -> Result<()> {
    let watermarks = state.storage.watermarks().await?;

    if watermarks.is_empty() {
        info!("No watermarks are stored yet");
    }

    for watermark in watermarks {
        let last_checked = watermark.last_checked.format(&Rfc3339).with_context(|| {
            anyhow!("could not format the watermark of `{}`", watermark.source_name)
        })?;
        println!("{}\t{last_checked}", watermark.source_name);
    }

    Ok(())
}
