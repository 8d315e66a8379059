//! Helper functions

use std::time::Instant;

pub fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Round half away from zero to `decimals` places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

pub fn mean(values: impl ExactSizeIterator<Item = f64>) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    Some(values.sum::<f64>() / n as f64)
}

/// Wilder-style average true range over the last `period` bars
pub fn average_true_range(bars: &[crate::utils::types::Bar], period: usize) -> Option<f64> {
    if bars.len() < 2 || period == 0 {
        return None;
    }
    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let bar = &w[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect();
    let tail = &ranges[ranges.len().saturating_sub(period)..];
    mean(tail.iter().copied())
}
