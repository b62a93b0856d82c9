// ===============================
// src/paper.rs (in-process paper gateway)
// ===============================
//
// Stands in for the brokerage link: same `BrokerGateway` surface, same event
// stream, no wire. Orders are acknowledged right away and filled at the current
// mark after `fill_delay`; fills feed a paper book that answers position and
// PnL subscriptions.
//
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, sleep, Duration, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::domain::{
    Contract, GatewayEvent, OrderId, OrderState, OrderUpdate, PnlSnapshot, RequestId, Side, Symbol,
};
use crate::feed;
use crate::gateway::{BrokerGateway, GatewayError};

// gateway error codes mirrored by the paper book
pub const ERR_FILLED_ORDER: i32 = 104;
pub const ERR_CANCEL_UNKNOWN: i32 = 10147;

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub account: String,
    pub starting_order_id: OrderId,
    pub fill_delay: Duration,
    pub tick_interval: Duration,
    pub pnl_interval: Duration,
    pub start_price: f64,
    pub price_increment: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            account: "PAPER".into(),
            starting_order_id: 1,
            fill_delay: Duration::from_millis(250),
            tick_interval: Duration::from_millis(500),
            pnl_interval: Duration::from_secs(1),
            start_price: 100.0,
            price_increment: 0.25,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaperPosition { pub qty: i64, pub avg_cost: f64 }

#[derive(Debug, Clone)]
struct PendingOrder { symbol: Symbol, side: Side, qty: u64 }

#[derive(Debug, Default)]
pub struct Book {
    start_price: f64,
    marks: HashMap<Symbol, f64>,
    positions: HashMap<Symbol, PaperPosition>,
    realized: f64,
    pending: HashMap<OrderId, PendingOrder>,
    done: HashSet<OrderId>,
    max_order_id: OrderId,
    positions_subscribed: bool,
}

impl Book {
    pub fn mark(&self, sym: &Symbol) -> f64 {
        self.marks.get(sym).copied().unwrap_or(self.start_price)
    }

    pub fn nudge_mark(&mut self, sym: &Symbol, step: f64, floor: f64) -> f64 {
        let start = self.start_price;
        let px = self.marks.entry(sym.clone()).or_insert(start);
        *px = (*px + step).max(floor);
        *px
    }

    pub fn position(&self, sym: &Symbol) -> PaperPosition {
        self.positions.get(sym).cloned().unwrap_or_default()
    }

    pub fn apply_fill(&mut self, sym: &Symbol, side: Side, qty: u64, px: f64) {
        let signed = side.sign() * qty as i64;
        let pos = self.positions.entry(sym.clone()).or_default();
        let prev = pos.qty;

        if prev == 0 || prev.signum() == signed.signum() {
            // same direction -> blend cost
            let total = (prev.abs() + signed.abs()) as f64;
            pos.avg_cost = (pos.avg_cost * prev.abs() as f64 + px * signed.abs() as f64) / total;
            pos.qty = prev + signed;
        } else {
            // opposite direction -> realize on the closed part
            let closed = signed.abs().min(prev.abs()) as f64;
            self.realized += (px - pos.avg_cost) * closed * prev.signum() as f64;
            pos.qty = prev + signed;
            if pos.qty == 0 {
                pos.avg_cost = 0.0;
            } else if pos.qty.signum() != prev.signum() {
                pos.avg_cost = px;
            }
        }
    }

    pub fn pnl(&self) -> PnlSnapshot {
        let unrealized: f64 = self
            .positions
            .iter()
            .filter(|(_, p)| p.qty != 0)
            .map(|(sym, p)| (self.mark(sym) - p.avg_cost) * p.qty as f64)
            .sum();
        PnlSnapshot { daily: self.realized + unrealized, unrealized, realized: self.realized }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedBook(Arc<Mutex<Book>>);

impl SharedBook {
    fn new(start_price: f64) -> Self {
        Self(Arc::new(Mutex::new(Book { start_price, ..Default::default() })))
    }

    // never held across an await
    pub fn lock(&self) -> MutexGuard<'_, Book> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PaperGateway {
    cfg: PaperConfig,
    events: mpsc::UnboundedSender<GatewayEvent>,
    book: SharedBook,
    connected: bool,
    connect_options: Option<String>,
    feeds: HashMap<RequestId, JoinHandle<()>>,
    pnl_task: Option<JoinHandle<()>>,
}

impl PaperGateway {
    pub fn new(events: mpsc::UnboundedSender<GatewayEvent>, cfg: PaperConfig) -> Self {
        let book = SharedBook::new(cfg.start_price);
        Self { cfg, events, book, connected: false, connect_options: None, feeds: HashMap::new(), pnl_task: None }
    }

    pub fn book(&self) -> SharedBook { self.book.clone() }

    fn emit(&self, ev: GatewayEvent) {
        let _ = self.events.send(ev);
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.is_connected() { Ok(()) } else { Err(GatewayError::NotConnected) }
    }

    fn next_valid_id(&self) -> OrderId {
        let book = self.book.lock();
        (book.max_order_id + 1).max(self.cfg.starting_order_id)
    }

    fn spawn_feed(&mut self, req_id: RequestId, contract: &Contract, quotes: bool) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        if self.feeds.contains_key(&req_id) {
            return Err(GatewayError::Rejected(format!("duplicate ticker id {req_id}")));
        }
        let tx = self.events.clone();
        let book = self.book.clone();
        let sym = contract.local_symbol.clone();
        let every = self.cfg.tick_interval;
        let incr = self.cfg.price_increment;
        let handle = if quotes {
            tokio::spawn(feed::run_quotes(tx, book, req_id, sym, every, incr))
        } else {
            tokio::spawn(feed::run_trades(tx, book, req_id, sym, every, incr))
        };
        self.feeds.insert(req_id, handle);
        Ok(())
    }

    fn spawn_fill(&self, order_id: OrderId) {
        let tx = self.events.clone();
        let book = self.book.clone();
        let delay = self.cfg.fill_delay;
        let account = self.cfg.account.clone();

        tokio::spawn(async move {
            sleep(delay).await;

            // collect under the lock, send after
            let mut out = Vec::new();
            {
                let mut b = book.lock();
                let Some(order) = b.pending.remove(&order_id) else { return };
                let px = b.mark(&order.symbol);
                b.apply_fill(&order.symbol, order.side, order.qty, px);
                b.done.insert(order_id);

                out.push(GatewayEvent::OrderStatus(OrderUpdate {
                    order_id,
                    status: OrderState::Filled,
                    filled: order.qty as f64,
                    remaining: 0.0,
                    avg_fill_price: px,
                }));
                if b.positions_subscribed {
                    let pos = b.position(&order.symbol);
                    out.push(GatewayEvent::Position {
                        account,
                        local_symbol: order.symbol.to_string(),
                        position: pos.qty as f64,
                        avg_cost: pos.avg_cost,
                    });
                }
            }
            for ev in out {
                let _ = tx.send(ev);
            }
        });
    }
}

impl BrokerGateway for PaperGateway {
    fn set_connect_options(&mut self, options: &str) {
        self.connect_options = Some(options.to_string());
    }

    fn connect(&mut self, host: &str, port: u16, client_id: i32) -> bool {
        info!(%host, port, client_id, options = ?self.connect_options, "paper gateway: connected");
        self.connected = true;
        self.emit(GatewayEvent::Ready { next_order_id: self.next_valid_id() });
        true
    }

    fn is_connected(&self) -> bool {
        self.connected && !self.events.is_closed()
    }

    fn disconnect(&mut self) {
        for (_, h) in self.feeds.drain() {
            h.abort();
        }
        if let Some(h) = self.pnl_task.take() {
            h.abort();
        }
        if self.connected {
            self.connected = false;
            self.emit(GatewayEvent::ConnectionClosed);
            info!("paper gateway: disconnected");
        }
    }

    fn subscribe_trades(&mut self, req_id: RequestId, contract: &Contract) -> Result<(), GatewayError> {
        self.spawn_feed(req_id, contract, false)
    }

    fn subscribe_quotes(&mut self, req_id: RequestId, contract: &Contract) -> Result<(), GatewayError> {
        self.spawn_feed(req_id, contract, true)
    }

    fn unsubscribe(&mut self, req_id: RequestId) -> Result<(), GatewayError> {
        match self.feeds.remove(&req_id) {
            Some(h) => {
                h.abort();
                Ok(())
            }
            None => Err(GatewayError::Rejected(format!("no market data subscription {req_id}"))),
        }
    }

    fn subscribe_pnl(&mut self, account: &str) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        if self.pnl_task.is_some() {
            return Err(GatewayError::Rejected("pnl already subscribed".into()));
        }
        debug!(%account, "paper gateway: pnl subscribed");
        let tx = self.events.clone();
        let book = self.book.clone();
        let every = self.cfg.pnl_interval;
        self.pnl_task = Some(tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let snap = book.lock().pnl();
                if tx.send(GatewayEvent::Pnl(snap)).is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    fn unsubscribe_pnl(&mut self) -> Result<(), GatewayError> {
        match self.pnl_task.take() {
            Some(h) => {
                h.abort();
                Ok(())
            }
            None => Err(GatewayError::Rejected("pnl not subscribed".into())),
        }
    }

    fn request_positions(&mut self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        let rows: Vec<GatewayEvent> = {
            let mut b = self.book.lock();
            b.positions_subscribed = true;
            b.positions
                .iter()
                .map(|(sym, p)| GatewayEvent::Position {
                    account: self.cfg.account.clone(),
                    local_symbol: sym.to_string(),
                    position: p.qty as f64,
                    avg_cost: p.avg_cost,
                })
                .collect()
        };
        for ev in rows {
            self.emit(ev);
        }
        self.emit(GatewayEvent::PositionEnd);
        Ok(())
    }

    fn cancel_positions(&mut self) -> Result<(), GatewayError> {
        self.book.lock().positions_subscribed = false;
        Ok(())
    }

    fn place_order(&mut self, order_id: OrderId, contract: &Contract, side: Side, qty: u64) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        if qty == 0 {
            return Err(GatewayError::Rejected("order size must be positive".into()));
        }

        let modify = {
            let mut b = self.book.lock();
            if b.done.contains(&order_id) {
                drop(b);
                self.emit(GatewayEvent::Error {
                    id: order_id,
                    code: ERR_FILLED_ORDER,
                    message: "Can't modify a filled order".into(),
                });
                return Ok(());
            }
            b.max_order_id = b.max_order_id.max(order_id);
            let order = PendingOrder { symbol: contract.local_symbol.clone(), side, qty };
            b.pending.insert(order_id, order).is_some()
        };

        self.emit(GatewayEvent::OrderStatus(OrderUpdate {
            order_id,
            status: OrderState::Submitted,
            filled: 0.0,
            remaining: qty as f64,
            avg_fill_price: 0.0,
        }));
        // a modify rides on the fill task already scheduled for this id
        if !modify {
            self.spawn_fill(order_id);
        }
        Ok(())
    }

    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        let cancelled = {
            let mut b = self.book.lock();
            let hit = b.pending.remove(&order_id);
            if hit.is_some() {
                b.done.insert(order_id);
            }
            hit
        };
        match cancelled {
            Some(order) => self.emit(GatewayEvent::OrderStatus(OrderUpdate {
                order_id,
                status: OrderState::Cancelled,
                filled: 0.0,
                remaining: order.qty as f64,
                avg_fill_price: 0.0,
            })),
            None => self.emit(GatewayEvent::Error {
                id: order_id,
                code: ERR_CANCEL_UNKNOWN,
                message: "OrderId that needs to be cancelled is not found".into(),
            }),
        }
        Ok(())
    }

    fn request_next_order_id(&mut self) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.emit(GatewayEvent::Ready { next_order_id: self.next_valid_id() });
        Ok(())
    }
}

impl Drop for PaperGateway {
    fn drop(&mut self) {
        for (_, h) in self.feeds.drain() {
            h.abort();
        }
        if let Some(h) = self.pnl_task.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(sym: &str) -> Contract {
        Contract {
            symbol: "MES".into(),
            local_symbol: Symbol::new(sym),
            sec_type: "FUT".into(),
            currency: "USD".into(),
            exchange: "GLOBEX".into(),
        }
    }

    fn gateway() -> (PaperGateway, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = PaperConfig { starting_order_id: 7, account: "DU1".into(), ..Default::default() };
        (PaperGateway::new(tx, cfg), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reports_next_valid_id() {
        let (mut gw, mut rx) = gateway();
        assert!(!gw.is_connected());
        assert!(gw.connect("127.0.0.1", 4002, 0));
        assert_eq!(rx.recv().await, Some(GatewayEvent::Ready { next_order_id: 7 }));
        assert_eq!(gw.place_order(1, &contract("MESH0"), Side::Buy, 1), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn fills_stream_status_and_positions() {
        let (mut gw, mut rx) = gateway();
        gw.connect("h", 1, 0);
        rx.recv().await;

        gw.request_positions().unwrap();
        assert_eq!(rx.recv().await, Some(GatewayEvent::PositionEnd));

        gw.place_order(7, &contract("MESH0"), Side::Sell, 3).unwrap();
        match rx.recv().await {
            Some(GatewayEvent::OrderStatus(u)) => assert_eq!(u.status, OrderState::Submitted),
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(GatewayEvent::OrderStatus(u)) => {
                assert_eq!(u.status, OrderState::Filled);
                assert_eq!(u.filled, 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await {
            Some(GatewayEvent::Position { account, local_symbol, position, .. }) => {
                assert_eq!(account, "DU1");
                assert_eq!(local_symbol, "MESH0");
                assert_eq!(position, -3.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        // reusing a filled id is refused, fresh baseline moves past it
        gw.place_order(7, &contract("MESH0"), Side::Buy, 3).unwrap();
        match rx.recv().await {
            Some(GatewayEvent::Error { code, .. }) => assert_eq!(code, ERR_FILLED_ORDER),
            other => panic!("unexpected {other:?}"),
        }
        gw.request_next_order_id().unwrap();
        assert_eq!(rx.recv().await, Some(GatewayEvent::Ready { next_order_id: 8 }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_order() {
        let (mut gw, mut rx) = gateway();
        gw.connect("h", 1, 0);
        rx.recv().await;
        gw.place_order(9, &contract("MESH0"), Side::Buy, 1).unwrap();
        rx.recv().await; // submitted
        gw.cancel_order(9).unwrap();
        match rx.recv().await {
            Some(GatewayEvent::OrderStatus(u)) => assert_eq!(u.status, OrderState::Cancelled),
            other => panic!("unexpected {other:?}"),
        }
        gw.cancel_order(9).unwrap();
        match rx.recv().await {
            Some(GatewayEvent::Error { code, .. }) => assert_eq!(code, ERR_CANCEL_UNKNOWN),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(gw.book().lock().position(&Symbol::new("MESH0")).qty, 0);
    }

    #[test]
    fn book_realizes_on_reduce_and_flip() {
        let mut b = Book { start_price: 100.0, ..Default::default() };
        let sym = Symbol::new("MESH0");
        b.apply_fill(&sym, Side::Buy, 2, 100.0);
        b.apply_fill(&sym, Side::Buy, 2, 102.0);
        assert_eq!(b.position(&sym).avg_cost, 101.0);

        b.apply_fill(&sym, Side::Sell, 6, 103.0);
        assert_eq!(b.realized, 8.0);
        let pos = b.position(&sym);
        assert_eq!(pos.qty, -2);
        assert_eq!(pos.avg_cost, 103.0);

        b.nudge_mark(&sym, 1.0, 0.25);
        // short 2 @ 103, mark 101
        assert_eq!(b.pnl(), PnlSnapshot { daily: 12.0, unrealized: 4.0, realized: 8.0 });
    }

    #[tokio::test]
    async fn requests_fail_when_disconnected() {
        let (mut gw, _rx) = gateway();
        assert_eq!(gw.request_positions(), Err(GatewayError::NotConnected));
        assert_eq!(gw.subscribe_trades(2000, &contract("MESH0")), Err(GatewayError::NotConnected));
    }
}
