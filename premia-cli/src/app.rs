//! Wires configuration, broker backend, feeds and the engine together.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use premia_broker::{ws, Broker, GatewayBroker, PaperBroker};
use premia_config::{load_config, AppConfig};
use premia_core::{strike_window, OptionSymbol, Symbol, TickSource};
use premia_journal::{FileJournal, Journal, NullJournal};

use crate::alerts::{AlertKind, AlertManager};
use crate::anchor::{self, Anchor};
use crate::engine::{Engine, EngineOutcome, JournalHandle, ShutdownSignal};
use crate::telemetry;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ExecutionBackend {
    Paper,
    Live,
}

/// Intraday options-shorting engine for NIFTY weeklies.
#[derive(Parser)]
#[command(author, version, about = "Premia live engine")]
pub struct Cli {
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long)]
    pub env: Option<String>,
    /// Expiry token, e.g. 06FEB26. Required unless --auto is set.
    #[arg(long)]
    pub expiry: Option<String>,
    /// At-the-money anchor strike. Required unless --auto is set.
    #[arg(long)]
    pub strike: Option<i64>,
    /// Detect the anchor strike and expiry from the gateway at startup.
    #[arg(long, conflicts_with_all = ["expiry", "strike"])]
    pub auto: bool,
    /// Execution backend. Paper is the default; live talks to the gateway.
    #[arg(long, value_enum, default_value = "paper")]
    pub backend: ExecutionBackend,
    /// Override the rupee value of one R.
    #[arg(long)]
    pub r_value: Option<i64>,
    /// Override the maximum number of simultaneous positions.
    #[arg(long)]
    pub max_positions: Option<usize>,
    /// Override the forced-flattening cutoff, HH:MM exchange time.
    #[arg(long)]
    pub cutoff: Option<String>,
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) -> Result<()> {
    if let Some(r_value) = cli.r_value {
        config.filter.r_value = Decimal::from(r_value);
        config.risk.r_value = Decimal::from(r_value);
    }
    if let Some(max_positions) = cli.max_positions {
        config.risk.max_positions = max_positions;
    }
    if let Some(cutoff) = &cli.cutoff {
        let parsed = chrono::NaiveTime::parse_from_str(cutoff, "%H:%M")
            .with_context(|| format!("invalid cutoff '{cutoff}', expected HH:MM"))?;
        config.session.clock.force_exit = parsed;
    }
    Ok(())
}

async fn resolve_anchor(config: &AppConfig, cli: &Cli) -> Result<Anchor> {
    if cli.auto {
        return anchor::detect(&config.broker.primary, &config.session.underlying)
            .await
            .context("anchor auto-detection failed");
    }
    match (&cli.expiry, cli.strike) {
        (Some(expiry), Some(strike)) => {
            // Validate the token by formatting one symbol through it.
            OptionSymbol::new(
                config.session.underlying.clone(),
                expiry.clone(),
                strike,
                premia_core::OptionSide::Ce,
            )
            .with_context(|| format!("invalid expiry token '{expiry}'"))?;
            Ok(Anchor {
                atm_strike: strike,
                expiry: expiry.clone(),
            })
        }
        _ => bail!("either --auto or both --expiry and --strike are required"),
    }
}

pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = load_config(cli.env.as_deref()).context("configuration failed to load")?;
    apply_overrides(&mut config, &cli)?;
    telemetry::init(&config.log_level);

    let anchor = resolve_anchor(&config, &cli).await?;
    let symbols: Vec<Symbol> = strike_window(
        &config.session.underlying,
        &anchor.expiry,
        anchor.atm_strike,
        config.session.strike_span,
        config.session.strike_interval,
    )
    .iter()
    .map(OptionSymbol::to_symbol)
    .collect();
    info!(
        atm = anchor.atm_strike,
        expiry = %anchor.expiry,
        symbols = symbols.len(),
        backend = ?cli.backend,
        "session window resolved"
    );

    let broker: Arc<dyn Broker> = match cli.backend {
        ExecutionBackend::Paper => Arc::new(PaperBroker::default()),
        ExecutionBackend::Live => Arc::new(GatewayBroker::new(config.broker.primary.clone())),
    };

    let journal: Box<dyn Journal> = if config.journal.enabled {
        Box::new(
            FileJournal::open(&config.journal.path).with_context(|| {
                format!("journal path {} unusable", config.journal.path.display())
            })?,
        )
    } else {
        Box::new(NullJournal)
    };
    let journal = JournalHandle::spawn(journal);
    let alerts = Arc::new(AlertManager::new(config.alerting.clone()));
    alerts
        .notify(
            AlertKind::Startup,
            "Engine starting",
            &format!(
                "anchor {} {} / {} symbols / {:?} backend",
                anchor.atm_strike,
                anchor.expiry,
                symbols.len(),
                cli.backend
            ),
        )
        .await;

    let (tick_tx, tick_rx) = mpsc::channel(config.engine.tick_channel_capacity);
    let mut feed_tasks = Vec::new();
    feed_tasks.push(ws::spawn_tick_stream(
        config.broker.primary.ws_url.clone(),
        config.broker.primary.api_key.clone(),
        symbols.clone(),
        TickSource::Primary,
        tick_tx.clone(),
    ));
    if let Some(backup) = config.broker.backup.clone() {
        feed_tasks.push(ws::spawn_tick_stream(
            backup.ws_url,
            backup.api_key,
            symbols.clone(),
            TickSource::Backup,
            tick_tx.clone(),
        ));
    } else {
        warn!("no backup feed configured; failover is disabled");
    }
    drop(tick_tx);

    let shutdown = ShutdownSignal::new();
    let signal_handle = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_handle.trigger();
        }
    });

    let engine = Engine::new(config, symbols, broker, journal, alerts);
    let outcome = engine.run(tick_rx, shutdown).await?;
    for task in feed_tasks {
        task.abort();
    }
    Ok(match outcome {
        EngineOutcome::Clean => 0,
        EngineOutcome::Aborted => 1,
    })
}
