//! Shared wall clock for deadline arithmetic.
//!
//! Every participant of a step compares `scheduled_time` and `deadline`
//! against the same timeline: unix seconds plus a process-wide offset. The
//! embedding system sets the offset once it has estimated the skew between
//! its local clock and the network-agreed clock, so deadlines computed on
//! one machine remain meaningful on another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static OFFSET_BITS: AtomicU64 = AtomicU64::new(0); // f64 0.0

/// Current shared-clock time in unix seconds.
pub fn now() -> f64 {
    let local = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    local + offset()
}

/// Offset currently applied on top of the local clock, in seconds.
pub fn offset() -> f64 {
    f64::from_bits(OFFSET_BITS.load(Ordering::Relaxed))
}

/// Sets the offset between the local clock and the shared timeline.
pub fn set_offset(offset: f64) {
    OFFSET_BITS.store(offset.to_bits(), Ordering::Relaxed);
}
