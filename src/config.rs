// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : exec_client, position-keeping execution client
Module  : config.rs
Version : 0.1.0
Author  : exec_client maintainers
License : MIT

Summary : Loads gateway, account, risk and runtime settings from the
          environment (optionally via .env), applies command-line
          overrides, and validates them into a single Config.
=============================================================================
*/
//
// Environment (optionally from .env) with CLI overrides.
//
//   IB_GATEWAY_URLNAME / IB_GATEWAY_URLPORT / IB_CLIENT_ID / IB_MAX_LOSS : required
//   IB_ACCOUNT_STR : optional here, required once the session asks for PnL
//
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "exec_client", about = "Position-keeping execution client")]
pub struct Cli {
    /// Gateway host (overrides IB_GATEWAY_URLNAME)
    #[arg(long)]
    pub host: Option<String>,
    /// Gateway port (overrides IB_GATEWAY_URLPORT)
    #[arg(long)]
    pub port: Option<u16>,
    /// Client id (overrides IB_CLIENT_ID)
    #[arg(long)]
    pub client_id: Option<i32>,
    /// Contract catalog (overrides TICKERS_FILE)
    #[arg(long)]
    pub tickers: Option<PathBuf>,
    /// Passed through to the gateway before connecting
    #[arg(long)]
    pub connect_options: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub max_loss: f64,
    pub account: Option<String>,
    pub tickers_file: PathBuf,
    pub connect_options: Option<String>,

    pub poll_timeout: Duration,
    pub subscription_cooldown: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,

    pub metrics_port: Option<u16>,
    pub record_file: Option<PathBuf>,
    pub log_callbacks: bool,
    pub paper_fill: Duration,
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw })
}

fn parse_bool(key: &'static str, raw: String) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}

impl Config {
    /// `.env` then the process environment.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(cli, |k| env::var(k).ok())
    }

    pub fn from_lookup(cli: &Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let optional = |key: &'static str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        // ---- Gateway ----
        let host = match &cli.host {
            Some(h) => h.clone(),
            None => required("IB_GATEWAY_URLNAME")?.trim().to_string(),
        };
        let port = match cli.port {
            Some(p) => p,
            None => parse("IB_GATEWAY_URLPORT", required("IB_GATEWAY_URLPORT")?)?,
        };
        let client_id = match cli.client_id {
            Some(c) => c,
            None => parse("IB_CLIENT_ID", required("IB_CLIENT_ID")?)?,
        };

        // ---- Risk ----
        let raw_loss = required("IB_MAX_LOSS")?;
        let max_loss: f64 = parse("IB_MAX_LOSS", raw_loss.clone())?;
        if !max_loss.is_finite() || max_loss < 0.0 {
            return Err(ConfigError::Invalid { key: "IB_MAX_LOSS", value: raw_loss });
        }
        let account = get("IB_ACCOUNT_STR").map(|a| a.trim().to_string());

        let tickers_file = cli
            .tickers
            .clone()
            .unwrap_or_else(|| PathBuf::from(optional("TICKERS_FILE", "tickers.txt")));
        let connect_options = cli.connect_options.clone().or_else(|| get("IB_CONNECT_OPTIONS"));

        // ---- Timing ----
        let poll_timeout = Duration::from_millis(parse("POLL_TIMEOUT_MS", optional("POLL_TIMEOUT_MS", "2000"))?);
        let subscription_cooldown =
            Duration::from_secs(parse("SUBSCRIPTION_COOLDOWN_SECS", optional("SUBSCRIPTION_COOLDOWN_SECS", "16"))?);
        let reconnect_attempts: u32 = parse("RECONNECT_ATTEMPTS", optional("RECONNECT_ATTEMPTS", "50"))?;
        if reconnect_attempts == 0 {
            return Err(ConfigError::Invalid { key: "RECONNECT_ATTEMPTS", value: "0".into() });
        }
        let reconnect_delay = Duration::from_secs(parse("RECONNECT_DELAY_SECS", optional("RECONNECT_DELAY_SECS", "50"))?);

        // ---- Observability / paper venue ----
        let metrics_port = match parse::<u16>("METRICS_PORT", optional("METRICS_PORT", "9898"))? {
            0 => None,
            p => Some(p),
        };
        let record_file = get("RECORD_FILE").map(PathBuf::from);
        let log_callbacks = parse_bool("LOG_CALLBACKS", optional("LOG_CALLBACKS", "true"))?;
        let paper_fill = Duration::from_millis(parse("PAPER_FILL_MS", optional("PAPER_FILL_MS", "250"))?);

        Ok(Config {
            host,
            port,
            client_id,
            max_loss,
            account,
            tickers_file,
            connect_options,
            poll_timeout,
            subscription_cooldown,
            reconnect_attempts,
            reconnect_delay,
            metrics_port,
            record_file,
            log_callbacks,
            paper_fill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("IB_GATEWAY_URLNAME", "127.0.0.1"),
        ("IB_GATEWAY_URLPORT", "4002"),
        ("IB_CLIENT_ID", "7"),
        ("IB_MAX_LOSS", "200"),
    ];

    #[test]
    fn defaults_fill_everything_optional() {
        let cfg = Config::from_lookup(&Cli::default(), env_of(BASE)).unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 4002);
        assert_eq!(cfg.client_id, 7);
        assert_eq!(cfg.max_loss, 200.0);
        assert_eq!(cfg.account, None);
        assert_eq!(cfg.tickers_file, PathBuf::from("tickers.txt"));
        assert_eq!(cfg.poll_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.subscription_cooldown, Duration::from_secs(16));
        assert_eq!(cfg.reconnect_attempts, 50);
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(50));
        assert_eq!(cfg.metrics_port, Some(9898));
        assert!(cfg.log_callbacks);
    }

    #[test]
    fn missing_required_keys_are_named() {
        let partial: Vec<_> = BASE.iter().copied().filter(|(k, _)| *k != "IB_MAX_LOSS").collect();
        assert_eq!(
            Config::from_lookup(&Cli::default(), env_of(&partial)),
            Err(ConfigError::Missing("IB_MAX_LOSS"))
        );
        let blank_host: Vec<_> = BASE
            .iter()
            .map(|&(k, v)| if k == "IB_GATEWAY_URLNAME" { (k, "  ") } else { (k, v) })
            .collect();
        assert_eq!(
            Config::from_lookup(&Cli::default(), env_of(&blank_host)),
            Err(ConfigError::Missing("IB_GATEWAY_URLNAME"))
        );
    }

    #[test]
    fn rejects_negative_or_garbage_numbers() {
        let mut bad_loss = BASE.to_vec();
        bad_loss[3] = ("IB_MAX_LOSS", "-5");
        assert!(matches!(
            Config::from_lookup(&Cli::default(), env_of(&bad_loss)),
            Err(ConfigError::Invalid { key: "IB_MAX_LOSS", .. })
        ));

        let mut bad_port = BASE.to_vec();
        bad_port[1] = ("IB_GATEWAY_URLPORT", "http");
        assert!(matches!(
            Config::from_lookup(&Cli::default(), env_of(&bad_port)),
            Err(ConfigError::Invalid { key: "IB_GATEWAY_URLPORT", .. })
        ));
    }

    #[test]
    fn cli_overrides_env_and_zero_port_disables_metrics() {
        let mut pairs = BASE.to_vec();
        pairs.push(("METRICS_PORT", "0"));
        pairs.push(("IB_ACCOUNT_STR", " DU123 "));
        pairs.push(("LOG_CALLBACKS", "off"));
        let cli = Cli { host: Some("gw.local".into()), port: Some(7497), ..Default::default() };
        let cfg = Config::from_lookup(&cli, env_of(&pairs)).unwrap();
        assert_eq!(cfg.host, "gw.local");
        assert_eq!(cfg.port, 7497);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.account.as_deref(), Some("DU123"));
        assert!(!cfg.log_callbacks);
    }

    #[test]
    fn cli_fills_in_missing_env() {
        let pairs = [("IB_MAX_LOSS", "50")];
        let cli = Cli { host: Some("h".into()), port: Some(1), client_id: Some(3), ..Default::default() };
        let cfg = Config::from_lookup(&cli, env_of(&pairs)).unwrap();
        assert_eq!(cfg.client_id, 3);
    }
}
