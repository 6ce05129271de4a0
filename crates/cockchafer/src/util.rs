use std::time::{Duration, Instant};

#[inline]
pub fn now_us(start: Instant) -> u64 {
    dur_us(start.elapsed())
}

#[inline]
pub fn dur_us(d: Duration) -> u64 {
    d.as_micros().min(u128::from(u64::MAX)) as u64
}
