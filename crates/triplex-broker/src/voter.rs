//! Plurality decision over replica results.

use std::collections::HashMap;

/// Votes needed to win: `⌈(N+1)/2⌉`.
pub fn majority_threshold(nmr: u8) -> usize {
    (nmr as usize + 1).div_ceil(2)
}

/// Pick the value returned by a majority of replicas.
///
/// `None` signals an irreconcilable divergence; the caller discards the
/// request without replying. At most one value can reach the threshold,
/// so ties are impossible by construction.
pub fn vote(values: &[i32], nmr: u8) -> Option<i32> {
    let threshold = majority_threshold(nmr);
    let mut counts: HashMap<i32, usize> = HashMap::new();
    for &value in values {
        *counts.entry(value).or_default() += 1;
    }
    counts
        .into_iter()
        .find(|&(_, count)| count >= threshold)
        .map(|(value, _)| value)
}
