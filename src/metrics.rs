// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn int_gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

fn gauge(name: &str, help: &str) -> Gauge {
    Gauge::new(name, help).unwrap_or_else(|e| panic!("metric {name}: {e}"))
}

// -------- Session --------
pub static SESSION_STATE: Lazy<IntGauge> =
    Lazy::new(|| int_gauge("session_state", "current session state (ordinal, 0 = awaiting_connection)"));

pub static SESSION_TRANSITIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("session_transitions_total", "state transitions by target state", &["to"]));

pub static RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| counter("gateway_reconnects_total", "connection attempts after the first"));

pub static ORDER_ID_RESETS: Lazy<IntCounter> =
    Lazy::new(|| counter("order_id_resets_total", "order-id table resets"));

// -------- Orders & gateway --------
pub static ORDERS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("orders_total", "market orders placed", &["symbol", "side"]));

pub static ORDER_STATUS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("order_status_total", "order status callbacks", &["status"]));

pub static GATEWAY_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("gateway_errors_total", "gateway error callbacks by code", &["code"]));

pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("ticks_total_by_symbol", "market data ticks per symbol (kind: trade|quote)", &["symbol", "kind"])
});

// -------- Positions & PnL --------
pub static POSITION_ACTUAL: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("position_actual", "ledger actual position", &["symbol"]));

pub static POSITION_DESIRED: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("position_desired", "ledger desired position", &["symbol"]));

pub static PNL_DAILY: Lazy<Gauge> = Lazy::new(|| gauge("pnl_daily", "daily PnL"));
pub static PNL_UNREALIZED: Lazy<Gauge> = Lazy::new(|| gauge("pnl_unrealized", "unrealized PnL"));
pub static PNL_REALIZED: Lazy<Gauge> = Lazy::new(|| gauge("pnl_realized", "realized PnL"));
pub static PNL_CURRENT: Lazy<Gauge> = Lazy::new(|| gauge("pnl_current", "unrealized + realized"));
pub static PNL_HIGH_WATER: Lazy<Gauge> = Lazy::new(|| gauge("pnl_high_water", "best current profit seen"));

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_symbol", "configured symbols (label: symbol)", &["symbol"]));

pub static CONFIG_MAX_LOSS: Lazy<Gauge> =
    Lazy::new(|| gauge("config_max_loss", "drawdown threshold that triggers closeout"));

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SESSION_STATE.clone()),
        Box::new(SESSION_TRANSITIONS.clone()),
        Box::new(RECONNECTS.clone()),
        Box::new(ORDER_ID_RESETS.clone()),
        Box::new(ORDERS.clone()),
        Box::new(ORDER_STATUS.clone()),
        Box::new(GATEWAY_ERRORS.clone()),
        Box::new(TICKS_BY_SYMBOL.clone()),
        Box::new(POSITION_ACTUAL.clone()),
        Box::new(POSITION_DESIRED.clone()),
        Box::new(PNL_DAILY.clone()),
        Box::new(PNL_UNREALIZED.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(PNL_CURRENT.clone()),
        Box::new(PNL_HIGH_WATER.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
        Box::new(CONFIG_MAX_LOSS.clone()),
    ];
    for c in collectors {
        // already registered on a second init()
        if let Err(e) = REGISTRY.register(c) {
            warn!(?e, "metrics: register failed");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn respond(req: &Request<Body>) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => {
            resp.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            *resp.body_mut() = Body::from(encode_metrics());
        }
        _ => *resp.status_mut() = StatusCode::NOT_FOUND,
    }
    resp
}

/// Serves `/` and `/metrics` until the process exits. A bind failure is
/// logged and the client keeps running without an endpoint.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let builder = match Server::try_bind(&addr) {
        Ok(b) => b,
        Err(e) => {
            error!(%addr, ?e, "metrics: bind failed");
            return;
        }
    };
    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move { Ok::<_, Infallible>(respond(&req)) }))
    });
    info!("metrics listening on http://{addr}/ (and /metrics)");
    if let Err(e) = builder.serve(make_svc).await {
        error!(?e, "metrics: server stopped");
    }
}
