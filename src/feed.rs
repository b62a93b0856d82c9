// ===============================
// src/feed.rs
// ===============================
//
// Paper market data for the paper gateway:
// - run_trades : random-walk trade prints, moves the book's mark
// - run_quotes : bid/ask one increment apart around the current mark
//
// Both stop as soon as the event channel is gone; the gateway aborts them on
// unsubscribe.
//
use chrono::Utc;
use rand::Rng;
use tokio::{
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};

use crate::domain::{GatewayEvent, QuoteTick, RequestId, Symbol, TradeTick};
use crate::paper::SharedBook;

pub async fn run_trades(
    tx: mpsc::UnboundedSender<GatewayEvent>,
    book: SharedBook,
    req_id: RequestId,
    symbol: Symbol,
    every: Duration,
    increment: f64,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        // don't keep ThreadRng across .await
        let (steps, size) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-3i32..=3), rng.gen_range(1..=5))
        };
        let price = book.lock().nudge_mark(&symbol, steps as f64 * increment, increment);
        let ev = GatewayEvent::Trade(TradeTick { req_id, time: Utc::now(), price, size });
        if tx.send(ev).is_err() {
            break;
        }
    }
}

pub async fn run_quotes(
    tx: mpsc::UnboundedSender<GatewayEvent>,
    book: SharedBook,
    req_id: RequestId,
    symbol: Symbol,
    every: Duration,
    increment: f64,
) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let (bid_size, ask_size) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..=50), rng.gen_range(1..=50))
        };
        let mark = book.lock().mark(&symbol);
        let ev = GatewayEvent::Quote(QuoteTick {
            req_id,
            time: Utc::now(),
            bid: mark,
            ask: mark + increment,
            bid_size,
            ask_size,
        });
        if tx.send(ev).is_err() {
            break;
        }
    }
}
