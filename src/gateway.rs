// ===============================
// src/gateway.rs (broker gateway capability)
// ===============================
//
// Requests go out through `BrokerGateway`; everything the gateway says back
// arrives as `GatewayEvent`s on the channel handed to the implementation when it
// is built. The session only ever sees those events from the polling loop.
//
use thiserror::Error;

use crate::domain::{Contract, OrderId, RequestId, Side};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway is not connected")]
    NotConnected,
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

pub trait BrokerGateway {
    fn set_connect_options(&mut self, _options: &str) {}
    fn connect(&mut self, host: &str, port: u16, client_id: i32) -> bool;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self);

    fn subscribe_trades(&mut self, req_id: RequestId, contract: &Contract) -> Result<(), GatewayError>;
    fn subscribe_quotes(&mut self, req_id: RequestId, contract: &Contract) -> Result<(), GatewayError>;
    fn unsubscribe(&mut self, req_id: RequestId) -> Result<(), GatewayError>;

    fn subscribe_pnl(&mut self, account: &str) -> Result<(), GatewayError>;
    fn unsubscribe_pnl(&mut self) -> Result<(), GatewayError>;

    fn request_positions(&mut self) -> Result<(), GatewayError>;
    fn cancel_positions(&mut self) -> Result<(), GatewayError>;

    fn place_order(&mut self, order_id: OrderId, contract: &Contract, side: Side, qty: u64) -> Result<(), GatewayError>;
    fn cancel_order(&mut self, order_id: OrderId) -> Result<(), GatewayError>;

    /// Ask for a fresh next-valid-id; the answer comes back as `GatewayEvent::Ready`.
    fn request_next_order_id(&mut self) -> Result<(), GatewayError>;
}
