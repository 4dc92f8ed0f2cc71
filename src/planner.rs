// src/planner.rs

use crate::config::ConfigError;
use crate::models::Segment;

/// Splits `[0, total_size)` into `concurrency` contiguous segments.
///
/// Every segment gets `total_size / concurrency` bytes and the last one also
/// takes the remainder. With more segments than bytes, the first
/// `total_size` segments hold one byte each and the rest are empty.
///
/// The result only depends on the two arguments, so a resumed transfer sees
/// the same boundaries as the attempt that left its partial files behind.
pub fn plan_segments(total_size: u64, concurrency: usize) -> Result<Vec<Segment>, ConfigError> {
    if concurrency == 0 {
        return Err(ConfigError::InvalidConcurrency(concurrency));
    }
    if total_size == 0 {
        return Ok((0..concurrency).map(|i| Segment::new(i, 1, 0)).collect());
    }

    let count = concurrency as u64;
    let part_size = total_size / count;

    if part_size == 0 {
        return Ok((0..count)
            .map(|i| {
                if i < total_size {
                    Segment::new(i as usize, i, i)
                } else {
                    Segment::empty(i as usize, total_size - 1)
                }
            })
            .collect());
    }

    Ok((0..count)
        .map(|i| {
            let start = i * part_size;
            let end = if i == count - 1 {
                total_size - 1
            } else {
                start + part_size - 1
            };
            Segment::new(i as usize, start, end)
        })
        .collect())
}
