// ===============================
// src/session.rs (request sequencing + reconciliation state machine)
// ===============================
//
// AwaitingConnection -> RequestTradeData -> RequestOrderData -> RequestPnl
//   -> RequestPositions -> CheckPositions <-> CheckPnl -> Closeout -> Unsubscribe
//
// `poll` performs one step. `handle_event` applies one gateway callback. Both are
// called from the same loop (client.rs), never concurrently.
//
use std::time::{Duration, Instant};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::domain::{Event, GatewayEvent, OrderId, OrderRecord, SessionState, Side, Stamped, Symbol};
use crate::gateway::{BrokerGateway, GatewayError};
use crate::metrics::{
    GATEWAY_ERRORS, ORDERS, ORDER_STATUS, SESSION_STATE, SESSION_TRANSITIONS, TICKS_BY_SYMBOL,
};
use crate::order_ids::{OrderIdAllocator, OrderIdError, SlotId};
use crate::positions::{LedgerError, PositionLedger};
use crate::risk::RiskGovernor;
use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    OrderId(#[from] OrderIdError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("IB_ACCOUNT_STR is not set, cannot subscribe to account PnL")]
    MissingAccount,
}

impl SessionError {
    /// Gateway request failures are retried on the next poll; everything else ends the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Gateway(_))
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_loss: f64,
    pub account: Option<String>,
    pub subscription_cooldown: Duration,
    pub log_callbacks: bool,
}

pub struct Session {
    state: SessionState,
    ledger: PositionLedger,
    order_ids: OrderIdAllocator,
    risk: RiskGovernor,
    settings: SessionSettings,
    strategy: Box<dyn Strategy>,

    // instruments already subscribed in the current request state
    progress: usize,
    trade_data_requested_at: Option<Instant>,
    positions_requested: bool,
    halted: bool,

    order_symbols: HashMap<OrderId, Symbol>,
    finished_orders: HashSet<OrderId>,
    recorder: Option<mpsc::Sender<Stamped>>,
}

impl Session {
    pub fn new(catalog: &Catalog, settings: SessionSettings, strategy: Box<dyn Strategy>) -> Self {
        let ledger = PositionLedger::from_catalog(catalog);
        let order_ids = OrderIdAllocator::new(ledger.len());
        SESSION_STATE.set(SessionState::AwaitingConnection.ordinal());
        Self {
            state: SessionState::AwaitingConnection,
            ledger,
            order_ids,
            risk: RiskGovernor::new(),
            settings,
            strategy,
            progress: 0,
            trade_data_requested_at: None,
            positions_requested: false,
            halted: false,
            order_symbols: HashMap::new(),
            finished_orders: HashSet::new(),
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Stamped>) -> Self {
        self.recorder = Some(tx);
        self
    }

    pub fn state(&self) -> SessionState { self.state }
    pub fn is_halted(&self) -> bool { self.halted }
    pub fn ledger(&self) -> &PositionLedger { &self.ledger }
    pub fn risk(&self) -> &RiskGovernor { &self.risk }

    // ---- State machine ----

    pub fn poll<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G, now: Instant) -> Result<(), SessionError> {
        let step = match self.state {
            // Ready moves us on, see handle_event
            SessionState::AwaitingConnection => Ok(()),
            SessionState::RequestTradeData => self.request_trade_data(gw, now),
            SessionState::RequestOrderData => self.request_order_data(gw, now),
            SessionState::RequestPnl => self.request_pnl(gw),
            SessionState::RequestPositions => self.request_positions(gw),
            SessionState::CheckPositions => self.check_positions(gw),
            SessionState::CheckPnl => {
                self.check_pnl();
                Ok(())
            }
            SessionState::Closeout => self.closeout(gw),
            SessionState::Unsubscribe => {
                self.unsubscribe(gw);
                Ok(())
            }
        };

        match step {
            Err(SessionError::Gateway(e)) => {
                warn!(state = %self.state, error = %e, "gateway request failed, retrying next poll");
                Ok(())
            }
            other => other,
        }
    }

    fn request_trade_data<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G, now: Instant) -> Result<(), SessionError> {
        for rec in self.ledger.records().skip(self.progress) {
            gw.subscribe_trades(rec.trade_request_id(), rec.contract())?;
            debug!(symbol = %rec.symbol(), req_id = rec.trade_request_id(), "trade prints subscribed");
            self.progress += 1;
        }
        self.trade_data_requested_at = Some(now);
        self.transition(SessionState::RequestOrderData);
        Ok(())
    }

    fn request_order_data<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G, now: Instant) -> Result<(), SessionError> {
        if let Some(at) = self.trade_data_requested_at {
            if now.saturating_duration_since(at) < self.settings.subscription_cooldown {
                return Ok(());
            }
        }
        for rec in self.ledger.records().skip(self.progress) {
            gw.subscribe_quotes(rec.order_request_id(), rec.contract())?;
            debug!(symbol = %rec.symbol(), req_id = rec.order_request_id(), "quotes subscribed");
            self.progress += 1;
        }
        self.transition(SessionState::RequestPnl);
        Ok(())
    }

    fn request_pnl<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G) -> Result<(), SessionError> {
        let account = self.settings.account.as_deref().ok_or(SessionError::MissingAccount)?;
        gw.subscribe_pnl(account)?;
        info!(%account, "pnl subscribed");
        self.transition(SessionState::RequestPositions);
        Ok(())
    }

    fn request_positions<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G) -> Result<(), SessionError> {
        // PositionEnd advances the state
        if !self.positions_requested {
            gw.request_positions()?;
            self.positions_requested = true;
        }
        Ok(())
    }

    fn check_positions<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G) -> Result<(), SessionError> {
        for (sym, delta) in self.ledger.mismatches() {
            match self.place_market_order(gw, &sym, delta) {
                Ok(()) => {}
                Err(SessionError::Gateway(e)) => {
                    warn!(symbol = %sym, delta, error = %e, "reconcile order failed, ledger unchanged");
                }
                Err(e) => return Err(e),
            }
        }
        self.transition(SessionState::CheckPnl);
        Ok(())
    }

    fn check_pnl(&mut self) {
        if self.risk.should_liquidate(self.settings.max_loss) {
            error!(
                high_water = self.risk.high_water_mark(),
                current = self.risk.current_profit(),
                drawdown = self.risk.drawdown(),
                daily = self.risk.last().daily,
                max_loss = self.settings.max_loss,
                "max drawdown exceeded, liquidating"
            );
            self.transition(SessionState::Closeout);
        } else {
            self.transition(SessionState::CheckPositions);
        }
    }

    fn closeout<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G) -> Result<(), SessionError> {
        let mut flat = true;
        for (sym, actual) in self.ledger.exposures() {
            match self.place_market_order(gw, &sym, -actual) {
                Ok(()) => {}
                Err(SessionError::Gateway(e)) => {
                    warn!(symbol = %sym, actual, error = %e, "flatten order failed");
                    flat = false;
                }
                Err(e) => return Err(e),
            }
        }
        if flat {
            self.transition(SessionState::Unsubscribe);
        }
        Ok(())
    }

    fn unsubscribe<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G) {
        if self.halted {
            return;
        }
        let mut results = vec![("pnl", gw.unsubscribe_pnl()), ("positions", gw.cancel_positions())];
        for rec in self.ledger.records() {
            results.push(("trades", gw.unsubscribe(rec.trade_request_id())));
            results.push(("quotes", gw.unsubscribe(rec.order_request_id())));
        }
        for (what, res) in results {
            if let Err(e) = res {
                warn!(what, error = %e, "unsubscribe failed");
            }
        }
        self.halted = true;
        info!("session halted");
    }

    /// Send one market order moving `sym` by `delta` and apply it to the ledger.
    fn place_market_order<G: BrokerGateway + ?Sized>(
        &mut self,
        gw: &mut G,
        sym: &Symbol,
        delta: i64,
    ) -> Result<(), SessionError> {
        let Some((side, qty)) = Side::for_delta(delta) else { return Ok(()) };
        let slot = self.ledger.slot(sym)?;
        let order_id = self.order_ids.get_id(slot)?;

        if self.order_ids.has_changed(slot)? {
            if let Ok(SlotId::Held(stale)) = self.order_ids.last_id(slot) {
                if stale != order_id && !self.finished_orders.contains(&stale) {
                    info!(symbol = %sym, stale, order_id, "cancelling order left on a recycled slot");
                    if let Err(e) = gw.cancel_order(stale) {
                        warn!(stale, error = %e, "stale order cancel failed");
                    }
                }
            }
        }

        gw.place_order(order_id, self.ledger.contract(sym)?, side, qty)?;
        let actual = self.ledger.increment_actual(sym, side.sign() * qty as i64)?;

        ORDERS.with_label_values(&[sym.as_str(), side.action()]).inc();
        info!(symbol = %sym, order_id, side = side.action(), qty, actual, "market order placed");
        self.order_symbols.insert(order_id, sym.clone());
        self.record(Event::Order(OrderRecord { order_id, symbol: sym.clone(), side, qty }));
        Ok(())
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.progress = 0;
        info!(%from, %to, "transition");
        SESSION_STATE.set(to.ordinal());
        SESSION_TRANSITIONS.with_label_values(&[to.as_str()]).inc();
        self.record(Event::Transition { from, to });
    }

    fn record(&self, event: Event) {
        if let Some(tx) = &self.recorder {
            if tx.try_send(Stamped { ts: Utc::now(), event }).is_err() {
                debug!("recorder channel full or closed, event dropped");
            }
        }
    }

    // ---- Callbacks ----

    pub fn handle_event<G: BrokerGateway + ?Sized>(&mut self, gw: &mut G, ev: GatewayEvent) -> Result<(), SessionError> {
        if self.settings.log_callbacks {
            info!(event = ?ev, "callback");
        } else {
            debug!(event = ?ev, "callback");
        }
        if self.recorder.is_some() {
            self.record(Event::Gateway(ev.clone()));
        }

        match ev {
            GatewayEvent::Ready { next_order_id } => {
                let reset = self.order_ids.check_max_against(next_order_id);
                debug!(next_order_id, reset, "next valid id");
                if self.state == SessionState::AwaitingConnection {
                    self.transition(SessionState::RequestTradeData);
                }
            }
            GatewayEvent::Error { id, code, message } => {
                let label = code.to_string();
                GATEWAY_ERRORS.with_label_values(&[label.as_str()]).inc();
                warn!(id, code, %message, "gateway error");
            }
            GatewayEvent::OrderStatus(update) => {
                ORDER_STATUS.with_label_values(&[update.status.label()]).inc();
                let symbol = self.order_symbols.get(&update.order_id).cloned();
                info!(
                    order_id = update.order_id,
                    symbol = symbol.as_ref().map(Symbol::as_str).unwrap_or("?"),
                    status = ?update.status,
                    filled = update.filled,
                    remaining = update.remaining,
                    avg_fill_price = update.avg_fill_price,
                    "order status"
                );
                if update.status.is_terminal() && self.finished_orders.insert(update.order_id) {
                    // the slot must not resend a finished id
                    if let Some(sym) = &symbol {
                        let slot = self.ledger.slot(sym)?;
                        self.order_ids.release(slot, update.order_id)?;
                    }
                    if !self.halted {
                        // fresh baseline so the finished line gets a new id
                        if let Err(e) = gw.request_next_order_id() {
                            warn!(error = %e, "next order id request failed");
                        }
                    }
                }
            }
            GatewayEvent::Position { account, local_symbol, position, avg_cost } => {
                if let Some(ours) = self.settings.account.as_deref() {
                    if ours != account {
                        debug!(%account, %local_symbol, "position for another account, ignored");
                        return Ok(());
                    }
                }
                let sym = Symbol::new(&local_symbol);
                if !self.ledger.contains(&sym) {
                    warn!(symbol = %sym, position, "position in untracked symbol, skipped");
                    return Ok(());
                }
                let qty = position.round() as i64;
                self.ledger.set_actual(&sym, qty)?;
                debug!(symbol = %sym, qty, avg_cost, "position synced");
            }
            GatewayEvent::PositionEnd => {
                if self.state == SessionState::RequestPositions {
                    self.transition(SessionState::CheckPositions);
                }
            }
            GatewayEvent::Pnl(snap) => match self.risk.update(snap) {
                Ok(true) => debug!(high_water = self.risk.high_water_mark(), "new high-water mark"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "pnl update ignored"),
            },
            GatewayEvent::Trade(tick) => {
                let sym = self.ledger.lookup_symbol(tick.req_id)?.clone();
                TICKS_BY_SYMBOL.with_label_values(&[sym.as_str(), "trade"]).inc();
                if let Some(target) = self.strategy.on_trade(&sym, &tick) {
                    self.set_target(&sym, target)?;
                }
            }
            GatewayEvent::Quote(tick) => {
                let sym = self.ledger.lookup_symbol(tick.req_id)?.clone();
                TICKS_BY_SYMBOL.with_label_values(&[sym.as_str(), "quote"]).inc();
                if let Some(target) = self.strategy.on_quote(&sym, &tick) {
                    self.set_target(&sym, target)?;
                }
            }
            GatewayEvent::ConnectionClosed => warn!(state = %self.state, "gateway connection closed"),
        }
        Ok(())
    }

    fn set_target(&mut self, sym: &Symbol, target: i64) -> Result<(), SessionError> {
        if self.ledger.desired(sym)? != target {
            info!(symbol = %sym, target, "desired position changed");
            self.ledger.set_desired(sym, target)?;
        }
        Ok(())
    }
}
