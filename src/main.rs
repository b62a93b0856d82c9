// ===============================
// src/main.rs
// ===============================
/*
 # tracked symbols, state and drawdown
 curl -s localhost:9898/metrics | egrep '^(config_symbol|session_state|pnl_)'

 # orders and statuses
 curl -s localhost:9898/metrics | egrep '^(orders_total|order_status_total)'
*/
/*
=============================================================================
Project : exec_client, position-keeping execution client
Module  : main.rs
Version : 0.1.0
Author  : exec_client maintainers
License : MIT

Summary : Sequences market-data / PnL / position subscriptions against a
          broker gateway, reconciles desired vs actual position per
          instrument with market orders, and flattens everything once the
          drawdown from the PnL high-water mark exceeds IB_MAX_LOSS.
          Exposes Prometheus metrics and records a JSONL event journal.
=============================================================================
*/
mod catalog;
mod client;
mod config;
mod domain;
mod feed;
mod gateway;
mod metrics;
mod order_ids;
mod paper;
mod positions;
mod recorder;
mod risk;
mod session;
mod strategy;

use clap::Parser;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::Catalog;
use crate::client::{ReconnectPlan, SessionOutcome};
use crate::config::{Cli, Config};
use crate::domain::Stamped;
use crate::paper::{PaperConfig, PaperGateway};
use crate::session::{Session, SessionSettings};
use crate::strategy::Hold;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config & catalog (fatal before connecting) ----
    let cli = Cli::parse();
    let cfg = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };
    let catalog = match Catalog::load(&cfg.tickers_file) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "contract catalog error");
            std::process::exit(2);
        }
    };

    let symbols: Vec<&str> = catalog.iter().map(|c| c.local_symbol.as_str()).collect();
    info!(
        host = %cfg.host,
        port = cfg.port,
        client_id = cfg.client_id,
        max_loss = cfg.max_loss,
        account = ?cfg.account,
        tickers = %cfg.tickers_file.display(),
        symbols = ?symbols,
        "startup config"
    );
    if cfg.account.is_none() {
        warn!("IB_ACCOUNT_STR not set, session will stop when it requests PnL");
    }

    // ---- Metrics ----
    metrics::init();
    metrics::CONFIG_MAX_LOSS.set(cfg.max_loss);
    for s in &symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[*s]).set(1);
    }
    if let Some(port) = cfg.metrics_port {
        tokio::spawn(metrics::serve_metrics(port));
    }

    // ---- Recorder (optional) ----
    let mut journal: Option<(mpsc::Sender<Stamped>, JoinHandle<()>)> = None;
    if let Some(path) = cfg.record_file.clone() {
        let (tx, rx) = mpsc::channel::<Stamped>(8192);
        journal = Some((tx, tokio::spawn(recorder::run(rx, path))));
    }

    // ---- Ctrl-C ----
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "ctrl-c handler unavailable");
                // hold the sender so the session keeps running
                std::future::pending::<()>().await;
                drop(stop_tx);
            }
        }
    });

    let settings = SessionSettings {
        max_loss: cfg.max_loss,
        account: cfg.account.clone(),
        subscription_cooldown: cfg.subscription_cooldown,
        log_callbacks: cfg.log_callbacks,
    };
    let paper_cfg = PaperConfig {
        account: cfg.account.clone().unwrap_or_else(|| PaperConfig::default().account),
        fill_delay: cfg.paper_fill,
        ..Default::default()
    };
    let plan = ReconnectPlan {
        host: cfg.host.clone(),
        port: cfg.port,
        client_id: cfg.client_id,
        connect_options: cfg.connect_options.clone(),
        attempts: cfg.reconnect_attempts,
        delay: cfg.reconnect_delay,
        poll_timeout: cfg.poll_timeout,
    };

    // ---- Connect / reconnect ----
    let journal_tx = journal.as_ref().map(|(tx, _)| tx.clone());
    let outcome = client::run_with_reconnect(
        &plan,
        |events| PaperGateway::new(events, paper_cfg.clone()),
        || {
            let session = Session::new(&catalog, settings.clone(), Box::new(Hold));
            match &journal_tx {
                Some(tx) => session.with_recorder(tx.clone()),
                None => session,
            }
        },
        &mut stop_rx,
    )
    .await;
    drop(journal_tx);

    let code = match outcome {
        Ok(SessionOutcome::Halted) => {
            info!("session halted after closeout, exiting");
            0
        }
        Ok(SessionOutcome::Shutdown) => 0,
        // cap reached or fatal error, both already logged
        Ok(SessionOutcome::Disconnected) | Err(_) => 1,
    };

    // ---- Flush journal ----
    if let Some((tx, handle)) = journal {
        drop(tx);
        let _ = handle.await;
    }
    std::process::exit(code);
}
