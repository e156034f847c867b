//! 2048-bit log bloom filters.

use ethereum_types::{Bloom, BloomInput};

use crate::receipt::Log;

/// The filter bits of a single log: its address and every topic.
pub fn log_bloom(log: &Log) -> Bloom {
    let mut bloom = Bloom::zero();
    bloom.accrue(BloomInput::Raw(log.address.as_bytes()));
    for topic in &log.topics {
        bloom.accrue(BloomInput::Raw(topic.as_bytes()));
    }
    bloom
}

/// OR-fold of [`log_bloom`] over `logs`, the per-receipt (and, folded again
/// over receipts, per-header) filter.
pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::zero();
    for log in logs {
        bloom.accrue_bloom(&log_bloom(log));
    }
    bloom
}
