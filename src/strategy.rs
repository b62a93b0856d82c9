// ===============================
// src/strategy.rs (signal hook)
// ===============================
//
// The session hands every trade print and quote to a `Strategy`; returning
// `Some(target)` sets that instrument's desired position. Signal generation
// itself lives outside this crate, so the binary runs with `Hold`.
//
use crate::domain::{QuoteTick, Symbol, TradeTick};

pub trait Strategy: Send {
    fn on_trade(&mut self, _symbol: &Symbol, _tick: &TradeTick) -> Option<i64> { None }
    fn on_quote(&mut self, _symbol: &Symbol, _tick: &QuoteTick) -> Option<i64> { None }
}

/// Never changes a target.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hold;

impl Strategy for Hold {}
