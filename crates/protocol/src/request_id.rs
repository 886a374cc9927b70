//! Snowflake-style request ids.
//!
//! Layout, most significant first: milliseconds since [`ID_EPOCH_MILLIS`],
//! 5-bit data-centre id, 5-bit worker id, 12-bit sequence.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};

/// Custom epoch, 2015-01-01 00:00:00 UTC minus eight hours.
pub const ID_EPOCH_MILLIS: i64 = 1_420_041_600_000;

const WORKER_ID_BITS: u32 = 5;
const DATA_CENTER_ID_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

/// Largest accepted worker id.
pub const MAX_WORKER_ID: u8 = (1 << WORKER_ID_BITS) - 1;

/// Largest accepted data-centre id.
pub const MAX_DATA_CENTER_ID: u8 = (1 << DATA_CENTER_ID_BITS) - 1;

const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Generates strictly increasing request ids.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    worker_id: u8,
    data_center_id: u8,
    sequence: i64,
    last_timestamp: i64,
}

impl RequestIdGenerator {
    /// Creates a generator, rejecting ids outside `0..=31`.
    pub fn new(worker_id: u8, data_center_id: u8) -> Result<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(ProtocolError::RequestId(format!(
                "worker id {} exceeds {}",
                worker_id, MAX_WORKER_ID
            )));
        }
        if data_center_id > MAX_DATA_CENTER_ID {
            return Err(ProtocolError::RequestId(format!(
                "data centre id {} exceeds {}",
                data_center_id, MAX_DATA_CENTER_ID
            )));
        }
        Ok(Self {
            worker_id,
            data_center_id,
            sequence: 0,
            last_timestamp: -1,
        })
    }

    /// Returns the next id using the system clock.
    pub fn next_id(&mut self) -> Result<i64> {
        self.next_id_with(current_millis)
    }

    fn next_id_with(&mut self, mut clock: impl FnMut() -> i64) -> Result<i64> {
        let mut timestamp = clock();
        if timestamp < self.last_timestamp {
            return Err(ProtocolError::RequestId(format!(
                "clock moved backwards by {} ms",
                self.last_timestamp - timestamp
            )));
        }

        if timestamp == self.last_timestamp {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                // Sequence exhausted for this millisecond.
                while timestamp <= self.last_timestamp {
                    std::thread::yield_now();
                    timestamp = clock();
                }
            }
        } else {
            self.sequence = 0;
        }
        self.last_timestamp = timestamp;

        Ok(((timestamp - ID_EPOCH_MILLIS) << (WORKER_ID_BITS + DATA_CENTER_ID_BITS + SEQUENCE_BITS))
            | (i64::from(self.data_center_id) << (SEQUENCE_BITS + WORKER_ID_BITS))
            | (i64::from(self.worker_id) << SEQUENCE_BITS)
            | self.sequence)
    }
}

impl Default for RequestIdGenerator {
    /// Worker 1, data centre 1.
    fn default() -> Self {
        Self {
            worker_id: 1,
            data_center_id: 1,
            sequence: 0,
            last_timestamp: -1,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
