// =============================================================================
// Market Profile Analyzer — POC and 70% value area from a volume histogram
// =============================================================================
//
// Input is the volume-by-price histogram produced by the storage layer:
// (bucket floor price, volume) pairs sorted by price ascending, sparse where
// no trades printed. POC is the bucket with maximum volume; the value area
// expands around it, always taking the higher-volume neighbour next, with an
// upward bias on ties, until at least 70% of window volume is enclosed.
// =============================================================================

use crate::types::MarketProfile;

/// Fraction of window volume the value area encloses.
const VALUE_AREA_FRACTION: f64 = 0.70;

/// Compute POC / VAH / VAL. Returns `None` on an empty histogram.
pub fn compute(histogram: &[(f64, f64)], timestamp: i64) -> Option<MarketProfile> {
    if histogram.is_empty() {
        return None;
    }

    let total: f64 = histogram.iter().map(|(_, v)| v).sum();
    if total <= 0.0 {
        return None;
    }

    // POC: maximum-volume bucket; equal volume resolves to the higher price.
    let mut poc_idx = 0;
    for (i, (_, volume)) in histogram.iter().enumerate() {
        if *volume >= histogram[poc_idx].1 {
            poc_idx = i;
        }
    }

    let mut enclosed = histogram[poc_idx].1;
    let mut low_idx = poc_idx;
    let mut high_idx = poc_idx;
    let target = total * VALUE_AREA_FRACTION;

    while enclosed < target && (low_idx > 0 || high_idx < histogram.len() - 1) {
        let below = low_idx.checked_sub(1).map(|i| histogram[i].1);
        let above = if high_idx + 1 < histogram.len() {
            Some(histogram[high_idx + 1].1)
        } else {
            None
        };

        match (below, above) {
            (Some(b), Some(a)) => {
                // Upward bias: ties expand toward higher prices.
                if a >= b {
                    high_idx += 1;
                    enclosed += a;
                } else {
                    low_idx -= 1;
                    enclosed += b;
                }
            }
            (Some(b), None) => {
                low_idx -= 1;
                enclosed += b;
            }
            (None, Some(a)) => {
                high_idx += 1;
                enclosed += a;
            }
            (None, None) => break,
        }
    }

    Some(MarketProfile {
        timestamp,
        poc: histogram[poc_idx].0,
        vah: histogram[high_idx].0,
        val: histogram[low_idx].0,
    })
}

// =============================================================================
// Tests
// =============================================================================
