use std::collections::BTreeMap;

use super::hist::{Histogram, INFINITE};

/// Maps every finite reuse distance of `hist` onto an LRU stack distance.
///
/// The stack distance grows by the probability that a reuse is at least as
/// long as the current distance, integrated over the reuse distance axis.
/// With `boundary` set, the last step of each interval is replaced by the
/// exact single-reference correction.
pub fn lru_sdist(hist: &Histogram, boundary: bool) -> BTreeMap<u64, f64> {
    let total = hist.total() as f64;
    let mut mapping = BTreeMap::new();
    if total == 0.0 {
        return mapping;
    }

    let mut remaining = total;
    let mut prev: Option<(u64, f64)> = None;
    let mut sdist = 0.0;
    for (rdist, count) in hist.iter().filter(|&(d, _)| d != INFINITE) {
        let rcdf = remaining / total;
        sdist = match prev {
            None => rdist as f64,
            Some((prev_rdist, prev_pdf)) if boundary => {
                sdist
                    + (rdist - prev_rdist - 1) as f64 * rcdf
                    + rcdf / (1.0 - prev_pdf)
            }
            Some((prev_rdist, _)) => sdist + (rdist - prev_rdist) as f64 * rcdf,
        };
        mapping.insert(rdist, sdist);
        prev = Some((rdist, count as f64 / total));
        remaining -= count as f64;
    }
    mapping
}

/// Converts a reuse-distance histogram into a stack-distance histogram using
/// its own mapping. Cold accesses stay cold.
pub fn sdist_hist(hist: &Histogram, boundary: bool) -> Histogram {
    let mapping = lru_sdist(hist, boundary);
    hist.iter()
        .map(|(rdist, count)| match mapping.get(&rdist) {
            Some(&s) => (s.round() as u64, count),
            None => (INFINITE, count),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn first_distance_maps_to_itself() {
        let hist: Histogram = [(3, 10), (7, 5), (INFINITE, 2)].into_iter().collect();
        let mapping = lru_sdist(&hist, false);
        assert_eq!(mapping[&3], 3.0);
        // reuse >= 7 has probability 7/17
        assert!((mapping[&7] - (3.0 + 4.0 * 7.0 / 17.0)).abs() < 1e-12);
        assert!(!mapping.contains_key(&INFINITE));
    }

    #[test]
    fn boundary_correction() {
        let hist: Histogram = [(1, 1), (3, 1)].into_iter().collect();
        let mapping = lru_sdist(&hist, true);
        // 1 + (3 - 1 - 1) * 0.5 + 0.5 / (1 - 0.5)
        assert!((mapping[&3] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn empty_histogram() {
        assert!(lru_sdist(&Histogram::new(), false).is_empty());
        assert!(sdist_hist(&Histogram::new(), false).is_empty());
    }

    proptest! {
        #[test]
        fn mapping_is_monotone(pairs in prop::collection::vec((0u64..100_000, 1u64..1000), 1..50), cold in 0u64..100) {
            let mut hist: Histogram = pairs.into_iter().collect();
            if cold > 0 {
                hist.add(INFINITE, cold);
            }
            let mapping = lru_sdist(&hist, false);
            let values: Vec<f64> = mapping.values().copied().collect();
            for w in values.windows(2) {
                prop_assert!(w[0] <= w[1]);
            }
            let sd = sdist_hist(&hist, false);
            prop_assert_eq!(sd.total(), hist.total());
            prop_assert_eq!(sd.get(INFINITE), hist.get(INFINITE));
        }
    }
}
