// SPDX-License-Identifier: Apache-2.0

//! Row budget shared by every request running under one process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::error::{EngineError, EngineResult};

#[derive(Debug)]
pub struct BufferManager {
    max_rows: u64,
    reserved: AtomicU64,
}

impl BufferManager {
    pub fn new(max_rows: u64) -> Self {
        Self {
            max_rows,
            reserved: AtomicU64::new(0),
        }
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Reserves room for `rows` rows. The reservation is returned when the
    /// guard is dropped.
    pub fn reserve(self: &Arc<Self>, rows: u64) -> EngineResult<BufferReservation> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(rows);
            if next > self.max_rows {
                return Err(EngineError::execution_error(format!(
                    "Buffer budget exceeded: {next} rows requested, limit is {}",
                    self.max_rows
                )));
            }
            match self.reserved.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(BufferReservation {
                        manager: Arc::clone(self),
                        rows,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Debug)]
pub struct BufferReservation {
    manager: Arc<BufferManager>,
    rows: u64,
}

impl BufferReservation {
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl Drop for BufferReservation {
    fn drop(&mut self) {
        self.manager.reserved.fetch_sub(self.rows, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_released_on_drop() {
        let manager = Arc::new(BufferManager::new(10));
        let first = manager.reserve(6).unwrap();
        assert!(manager.reserve(5).is_err());
        assert_eq!(manager.reserved(), 6);

        drop(first);
        assert_eq!(manager.reserved(), 0);
        assert_eq!(manager.reserve(10).unwrap().rows(), 10);
    }
}
