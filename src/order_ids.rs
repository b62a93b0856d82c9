// ===============================
// src/order_ids.rs (recyclable order ids)
// ===============================
//
// Sending an order with an id the gateway already knows *modifies* that order
// instead of placing a fresh one. Once a fill or cancel comes back, the slot needs
// a fresh id, and that id must be greater than every id used before, in this
// session or an earlier one (the gateway remembers ids across sessions).
//
// - the baseline comes from the gateway (`check_max_against`)
// - `get_id` recycles the slot's id, or mints `current_max + 1`
// - when the gateway reports a higher max, or we hold an id above our own max,
//   every slot is reset and its old id kept as "previous"
// - `has_changed` / `last_id` tell the caller a stale id may need cancelling
//
use thiserror::Error;

use crate::domain::OrderId;
use crate::metrics::ORDER_ID_RESETS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    Unused,
    Held(OrderId),
}

impl SlotId {
    fn held(self) -> Option<OrderId> {
        match self { SlotId::Held(id) => Some(id), SlotId::Unused => None }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderIdError {
    #[error("next valid order id has not been set by the gateway yet")]
    Uninitialized,
    #[error("order slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: usize, capacity: usize },
    #[error("order slot {0} has no previous id")]
    NoPreviousId(usize),
}

#[derive(Debug, Clone)]
pub struct OrderIdAllocator {
    current_max: Option<OrderId>,
    ids: Box<[SlotId]>,
    // None = never set
    last_ids: Box<[Option<SlotId>]>,
}

impl OrderIdAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            current_max: None,
            ids: vec![SlotId::Unused; capacity].into_boxed_slice(),
            last_ids: vec![None; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize { self.ids.len() }
    pub fn current_max(&self) -> Option<OrderId> { self.current_max }

    fn reset(&mut self) {
        for (last, cur) in self.last_ids.iter_mut().zip(self.ids.iter_mut()) {
            *last = Some(*cur);
            *cur = SlotId::Unused;
        }
        ORDER_ID_RESETS.inc();
    }

    /// Feed a gateway-reported id baseline. Returns `true` when every slot was reset.
    pub fn check_max_against(&mut self, n: OrderId) -> bool {
        let held_max = self.ids.iter().filter_map(|s| s.held()).max();
        let exceeds = self.current_max.map_or(true, |max| n > max);
        let stale = match (self.current_max, held_max) {
            (Some(max), Some(held)) => held > max,
            (None, Some(_)) => true,
            _ => false,
        };
        if !(exceeds || stale) {
            return false;
        }

        // never let the max move backwards, even if `n` is lower than what we hold
        let floor = self.current_max.into_iter().chain(held_max).max();
        self.current_max = Some(floor.map_or(n, |f| f.max(n)));
        self.reset();
        true
    }

    pub fn get_id(&mut self, slot: usize) -> Result<OrderId, OrderIdError> {
        let max = self.current_max.ok_or(OrderIdError::Uninitialized)?;
        self.check_slot(slot)?;

        match self.ids[slot] {
            SlotId::Held(id) => {
                self.last_ids[slot] = Some(SlotId::Held(id));
                Ok(id)
            }
            SlotId::Unused => {
                let id = max + 1;
                self.current_max = Some(id);
                self.ids[slot] = SlotId::Held(id);
                Ok(id)
            }
        }
    }

    /// Free a slot whose order `id` is finished, so the next `get_id` mints a
    /// fresh id instead of resending a filled or cancelled one. Returns `false`
    /// when the slot no longer holds `id`.
    pub fn release(&mut self, slot: usize, id: OrderId) -> Result<bool, OrderIdError> {
        self.check_slot(slot)?;
        if self.ids[slot] != SlotId::Held(id) {
            return Ok(false);
        }
        self.last_ids[slot] = Some(SlotId::Held(id));
        self.ids[slot] = SlotId::Unused;
        Ok(true)
    }

    pub fn last_id(&self, slot: usize) -> Result<SlotId, OrderIdError> {
        self.check_slot(slot)?;
        self.last_ids[slot].ok_or(OrderIdError::NoPreviousId(slot))
    }

    pub fn has_changed(&self, slot: usize) -> Result<bool, OrderIdError> {
        self.check_slot(slot)?;
        Ok(self.last_ids[slot] != Some(self.ids[slot]))
    }

    fn check_slot(&self, slot: usize) -> Result<(), OrderIdError> {
        if slot < self.ids.len() {
            Ok(())
        } else {
            Err(OrderIdError::SlotOutOfRange { slot, capacity: self.ids.len() })
        }
    }
}
