// ===============================
// src/positions.rs (position ledger: desired vs actual per instrument)
// ===============================
//
// `actual` moves two ways:
// - optimistically, by the signed size of every order we send (`increment_actual`)
// - authoritatively, whenever the gateway streams a position row (`set_actual`)
// Between the two there is a short window where `actual` can be stale. The
// positions subscription keeps streaming, so every fill is followed by a resync.
//
use ahash::AHashMap as HashMap;
use thiserror::Error;

use crate::catalog::Catalog;
use crate::domain::{Contract, RequestId, Symbol};
use crate::metrics::{POSITION_ACTUAL, POSITION_DESIRED};

/// First data request id handed out; trade then order id per instrument, in catalog order.
pub const FIRST_REQUEST_ID: RequestId = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("local symbol {0} is not tracked")]
    SymbolNotFound(Symbol),
    #[error("request id {0} does not belong to any tracked symbol")]
    RequestIdNotFound(RequestId),
}

#[derive(Debug, Clone)]
pub struct InstrumentRecord {
    pub actual_position: i64,
    pub desired_position: i64,
    trade_request_id: RequestId,
    order_request_id: RequestId,
    slot: usize,
    contract: Contract,
}

impl InstrumentRecord {
    pub fn symbol(&self) -> &Symbol { &self.contract.local_symbol }
    pub fn contract(&self) -> &Contract { &self.contract }
    pub fn trade_request_id(&self) -> RequestId { self.trade_request_id }
    pub fn order_request_id(&self) -> RequestId { self.order_request_id }
    pub fn slot(&self) -> usize { self.slot }
}

#[derive(Debug, Clone)]
pub struct PositionLedger {
    records: Vec<InstrumentRecord>,
    by_symbol: HashMap<Symbol, usize>,
    by_request: HashMap<RequestId, usize>,
}

impl PositionLedger {
    /// Catalog guarantees unique local symbols.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut records = Vec::with_capacity(catalog.len());
        let mut by_symbol = HashMap::with_capacity(catalog.len());
        let mut by_request = HashMap::with_capacity(catalog.len() * 2);
        let mut next_id = FIRST_REQUEST_ID;

        for (slot, spec) in catalog.iter().enumerate() {
            let trade_request_id = next_id;
            let order_request_id = next_id + 1;
            next_id += 2;

            by_symbol.insert(spec.local_symbol.clone(), slot);
            by_request.insert(trade_request_id, slot);
            by_request.insert(order_request_id, slot);
            records.push(InstrumentRecord {
                actual_position: 0,
                desired_position: 0,
                trade_request_id,
                order_request_id,
                slot,
                contract: spec.contract(),
            });
        }

        Self { records, by_symbol, by_request }
    }

    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn contains(&self, sym: &Symbol) -> bool { self.by_symbol.contains_key(sym) }

    /// Catalog order.
    pub fn records(&self) -> impl Iterator<Item = &InstrumentRecord> { self.records.iter() }
    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> { self.records.iter().map(|r| r.symbol()) }

    pub fn record(&self, sym: &Symbol) -> Result<&InstrumentRecord, LedgerError> {
        self.by_symbol
            .get(sym)
            .map(|&i| &self.records[i])
            .ok_or_else(|| LedgerError::SymbolNotFound(sym.clone()))
    }

    fn record_mut(&mut self, sym: &Symbol) -> Result<&mut InstrumentRecord, LedgerError> {
        match self.by_symbol.get(sym) {
            Some(&i) => Ok(&mut self.records[i]),
            None => Err(LedgerError::SymbolNotFound(sym.clone())),
        }
    }

    pub fn actual(&self, sym: &Symbol) -> Result<i64, LedgerError> {
        Ok(self.record(sym)?.actual_position)
    }

    pub fn desired(&self, sym: &Symbol) -> Result<i64, LedgerError> {
        Ok(self.record(sym)?.desired_position)
    }

    pub fn set_desired(&mut self, sym: &Symbol, value: i64) -> Result<(), LedgerError> {
        self.record_mut(sym)?.desired_position = value;
        POSITION_DESIRED.with_label_values(&[sym.as_str()]).set(value);
        Ok(())
    }

    /// Authoritative overwrite from a gateway position row.
    pub fn set_actual(&mut self, sym: &Symbol, value: i64) -> Result<(), LedgerError> {
        self.record_mut(sym)?.actual_position = value;
        POSITION_ACTUAL.with_label_values(&[sym.as_str()]).set(value);
        Ok(())
    }

    /// Optimistic adjustment on order placement; returns the new actual.
    pub fn increment_actual(&mut self, sym: &Symbol, delta: i64) -> Result<i64, LedgerError> {
        let rec = self.record_mut(sym)?;
        rec.actual_position += delta;
        let actual = rec.actual_position;
        POSITION_ACTUAL.with_label_values(&[sym.as_str()]).set(actual);
        Ok(actual)
    }

    /// Reverse lookup by either the trade or the order request id.
    pub fn lookup_symbol(&self, req_id: RequestId) -> Result<&Symbol, LedgerError> {
        self.by_request
            .get(&req_id)
            .map(|&i| self.records[i].symbol())
            .ok_or(LedgerError::RequestIdNotFound(req_id))
    }

    pub fn contract(&self, sym: &Symbol) -> Result<&Contract, LedgerError> {
        Ok(self.record(sym)?.contract())
    }

    pub fn trade_request_id(&self, sym: &Symbol) -> Result<RequestId, LedgerError> {
        Ok(self.record(sym)?.trade_request_id)
    }

    pub fn order_request_id(&self, sym: &Symbol) -> Result<RequestId, LedgerError> {
        Ok(self.record(sym)?.order_request_id)
    }

    pub fn slot(&self, sym: &Symbol) -> Result<usize, LedgerError> {
        Ok(self.record(sym)?.slot)
    }

    /// (symbol, desired - actual) for every instrument off target, catalog order.
    pub fn mismatches(&self) -> Vec<(Symbol, i64)> {
        self.records
            .iter()
            .filter(|r| r.desired_position != r.actual_position)
            .map(|r| (r.symbol().clone(), r.desired_position - r.actual_position))
            .collect()
    }

    /// (symbol, actual) for every instrument with exposure, catalog order.
    pub fn exposures(&self) -> Vec<(Symbol, i64)> {
        self.records
            .iter()
            .filter(|r| r.actual_position != 0)
            .map(|r| (r.symbol().clone(), r.actual_position))
            .collect()
    }
}
