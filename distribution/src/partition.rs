//! Partition algorithm
//!
//! Splits an integer pool of minor units into shares. Working in integer
//! units keeps the split exact: the shares always sum to the pool.
//!
//! # Random mode
//!
//! Shares are drawn one at a time. With `remaining` units left and `k` shares
//! still to fill after the current one, the current share is drawn uniformly
//! from `[1, (remaining - k) / k]`, which leaves at least one unit for every
//! later share and caps each draw at the fair average of what is left. The
//! last share takes the remainder, and the whole vector is shuffled so the
//! position of the (statistically larger) final share carries no information.

use crate::{types::SplitMode, Error, Result};
use rand::{seq::SliceRandom, Rng};

/// Split `total_units` into `count` shares using the thread RNG
pub fn partition(total_units: u64, count: u32, mode: SplitMode) -> Result<Vec<u64>> {
    partition_with(&mut rand::thread_rng(), total_units, count, mode)
}

/// Split `total_units` into `count` shares using `rng`
pub fn partition_with<R: Rng + ?Sized>(
    rng: &mut R,
    total_units: u64,
    count: u32,
    mode: SplitMode,
) -> Result<Vec<u64>> {
    if count == 0 {
        return Err(Error::InvalidShareCount(count));
    }
    if u64::from(count) > total_units {
        return Err(Error::TooSmallAmount { total_units, count });
    }

    match mode {
        SplitMode::Equal => equal(total_units, count),
        SplitMode::Random => Ok(random(rng, total_units, count)),
    }
}

fn equal(total_units: u64, count: u32) -> Result<Vec<u64>> {
    let count64 = u64::from(count);
    if total_units % count64 != 0 {
        return Err(Error::UnevenSplit { total_units, count });
    }
    Ok(vec![total_units / count64; count as usize])
}

fn random<R: Rng + ?Sized>(rng: &mut R, total_units: u64, count: u32) -> Vec<u64> {
    let mut shares = Vec::with_capacity(count as usize);
    let mut remaining = total_units;

    for drawn in 1..count {
        let after = u64::from(count - drawn);
        let bound = (remaining - after) / after;
        let value = if bound > 1 { rng.gen_range(1..=bound) } else { 1 };
        remaining -= value;
        shares.push(value);
    }
    shares.push(remaining);

    shares.shuffle(rng);
    shares
}

/// Positions of the first strict minimum and maximum
pub fn extremes_of(shares: &[u64]) -> (u32, u32) {
    let mut min = 0usize;
    let mut max = 0usize;
    for (i, value) in shares.iter().enumerate() {
        if *value < shares[min] {
            min = i;
        }
        if *value > shares[max] {
            max = i;
        }
    }
    (min as u32, max as u32)
}
