//! Burst-local reuse to stack distance conversion.
//!
//! A reuse landing in burst `l` took off somewhere earlier. The conversion
//! uses the reuse distribution of the bursts that can contain that takeoff,
//! merged into a "vicinity" that extends backwards from `l` on demand.

use std::collections::BTreeMap;

use crate::{diag::Diagnostics, error::TraceError, records::Burst, records::Sample};

use super::{
    hist::{Histogram, PcHistograms, INFINITE},
    lru::lru_sdist,
};

/// Reuse histograms keyed by the burst of the takeoff access, one per burst.
#[derive(Debug, Default)]
pub struct TakeoffHistograms {
    bursts: Vec<Histogram>,
}

impl TakeoffHistograms {
    pub fn from_samples<I>(samples: I) -> Result<Self, TraceError>
    where
        I: IntoIterator<Item = Result<Sample, TraceError>>,
    {
        let mut this = TakeoffHistograms::default();
        for sample in samples {
            let sample = sample?;
            let burst = sample.begin.burst_id;
            if this.bursts.len() <= burst {
                this.bursts.resize_with(burst + 1, Histogram::new);
            }
            let rdist = sample.reuse_distance().unwrap_or(INFINITE);
            this.bursts[burst].add(rdist, 1);
        }
        Ok(this)
    }

    pub fn len(&self) -> usize {
        self.bursts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bursts.is_empty()
    }

    fn merge_into(&self, first: usize, last: usize, into: &mut Histogram) {
        for hist in self.bursts.iter().take(last + 1).skip(first) {
            into.merge(hist);
        }
    }
}

/// Estimates the burst holding the takeoff of a reuse of length `rdist`
/// landing in `landing`, assuming the landing access sits in the middle of
/// its burst.
pub fn find_takeoff_burst(bursts: &[Burst], rdist: u64, landing: usize) -> usize {
    let first = bursts[0].memaccess_begin as i128;
    let l = &bursts[landing];
    let size = l.memaccess_end.saturating_sub(l.memaccess_begin) as i128;
    let takeoff = (l.memaccess_begin as i128 + size / 2 - rdist as i128 - 1).max(first);
    let after = bursts.partition_point(|b| b.memaccess_begin as i128 <= takeoff);
    after.saturating_sub(1).min(landing)
}

struct Vicinity<'a> {
    takeoffs: &'a TakeoffHistograms,
    landing: usize,
    oldest: Option<usize>,
    merged: Histogram,
    mapping: BTreeMap<u64, f64>,
    boundary: bool,
}

impl<'a> Vicinity<'a> {
    fn new(takeoffs: &'a TakeoffHistograms, landing: usize, boundary: bool) -> Self {
        Vicinity {
            takeoffs,
            landing,
            oldest: None,
            merged: Histogram::new(),
            mapping: BTreeMap::new(),
            boundary,
        }
    }

    fn extend_to(&mut self, begin: usize) {
        let last = match self.oldest {
            None => self.landing,
            Some(oldest) if begin < oldest => oldest - 1,
            Some(_) => return,
        };
        self.takeoffs.merge_into(begin, last, &mut self.merged);
        self.oldest = Some(begin);
        self.mapping = lru_sdist(&self.merged, self.boundary);
    }

    fn stack_distance(&mut self, rdist: u64, begin: usize) -> Option<u64> {
        self.extend_to(begin);
        while !self.mapping.contains_key(&rdist) {
            match self.oldest {
                Some(oldest) if oldest > 0 => self.extend_to(oldest - 1),
                _ => return None,
            }
        }
        self.mapping.get(&rdist).map(|s| s.round() as u64)
    }
}

/// Stack-distance histograms of one burst, optionally split per PC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDistances {
    pub hist: Histogram,
    pub per_pc: PcHistograms,
}

/// Converts the reuse histogram of `landing` (and its per-PC split, if any)
/// into stack distances. Distances that no vicinity explains are reported
/// and dropped.
pub fn transform(
    takeoffs: &TakeoffHistograms,
    bursts: &[Burst],
    landing: usize,
    hist: &Histogram,
    per_pc: &PcHistograms,
    boundary: bool,
    diag: &Diagnostics,
) -> StackDistances {
    let mut vicinity = Vicinity::new(takeoffs, landing, boundary);
    let mut out = StackDistances::default();
    for (rdist, count) in hist.iter() {
        let sdist = if rdist == INFINITE {
            INFINITE
        } else {
            let begin = find_takeoff_burst(bursts, rdist, landing);
            match vicinity.stack_distance(rdist, begin) {
                Some(s) => s,
                None => {
                    diag.warn(format_args!(
                        "burst {landing}: reuse distance {rdist} is not in the current mapping"
                    ));
                    continue;
                }
            }
        };
        out.hist.add(sdist, count);
        for (&pc, pc_hist) in per_pc {
            let n = pc_hist.get(rdist);
            if n > 0 {
                out.per_pc.entry(pc).or_default().add(sdist, n);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AccessEvent, AccessKind};

    fn burst(memaccess_begin: u64, memaccess_end: u64) -> Burst {
        Burst {
            memaccess_begin,
            memaccess_end,
            ..Default::default()
        }
    }

    fn sample(begin_burst: usize, begin_ac: u64, end_ac: Option<u64>) -> Result<Sample, TraceError> {
        let event = |burst_id, access_counter| AccessEvent {
            burst_id,
            access_counter,
            program_counter: 0,
            memory_address: 0,
            access_type: AccessKind::Load,
            thread_id: 0,
        };
        Ok(Sample {
            begin: event(begin_burst, begin_ac),
            end: end_ac.map(|ac| event(begin_burst, ac)),
        })
    }

    #[test]
    fn takeoff_estimate() {
        let bursts = vec![burst(0, 100), burst(1000, 1100), burst(2000, 2100)];
        // middle of burst 2 is 2050
        assert_eq!(find_takeoff_burst(&bursts, 10, 2), 2);
        assert_eq!(find_takeoff_burst(&bursts, 1000, 2), 1);
        assert_eq!(find_takeoff_burst(&bursts, 5000, 2), 0);
    }

    #[test]
    fn single_burst_end_to_end() {
        let samples = (0..10)
            .map(|i| sample(0, i * 10, Some(i * 10 + 4)))
            .chain((0..5).map(|i| sample(0, 200 + i * 10, Some(200 + i * 10 + 8))))
            .chain((0..2).map(|i| sample(0, 400 + i, None)));
        let takeoffs = TakeoffHistograms::from_samples(samples).unwrap();
        let bursts = vec![burst(0, 1000)];
        let landing: Histogram = [(3, 10), (7, 5), (INFINITE, 2)].into_iter().collect();

        let sd = transform(
            &takeoffs,
            &bursts,
            0,
            &landing,
            &PcHistograms::new(),
            false,
            &Diagnostics::disabled("test", "statstack"),
        );
        let expected: Histogram = [(3, 10), (5, 5), (INFINITE, 2)].into_iter().collect();
        assert_eq!(sd.hist, expected);
        assert_eq!(sd.hist.total(), 17);
    }

    #[test]
    fn vicinity_extends_backwards_until_mapped() {
        // the reuse of length 40 took off in burst 0, but the estimate
        // points into burst 1
        let samples = vec![sample(0, 90, Some(131)), sample(1, 100, Some(102))];
        let takeoffs = TakeoffHistograms::from_samples(samples).unwrap();
        let bursts = vec![burst(0, 100), burst(100, 200), burst(200, 300)];
        assert_eq!(find_takeoff_burst(&bursts, 40, 1), 1);
        let landing: Histogram = [(1, 1), (40, 1)].into_iter().collect();

        let sd = transform(
            &takeoffs,
            &bursts,
            1,
            &landing,
            &PcHistograms::new(),
            false,
            &Diagnostics::disabled("test", "statstack"),
        );
        assert_eq!(sd.hist.total(), 2);
    }

    #[test]
    fn unmapped_distance_is_dropped() {
        let takeoffs = TakeoffHistograms::from_samples(vec![sample(0, 0, Some(2))]).unwrap();
        let bursts = vec![burst(0, 100)];
        let landing: Histogram = [(1, 4), (99, 1)].into_iter().collect();
        let sd = transform(
            &takeoffs,
            &bursts,
            0,
            &landing,
            &PcHistograms::new(),
            false,
            &Diagnostics::disabled("test", "statstack"),
        );
        assert_eq!(sd.hist.to_pairs(), vec![(1, 4)]);
    }

    #[test]
    fn per_pc_split_follows_the_burst_mapping() {
        let takeoffs = TakeoffHistograms::from_samples(vec![
            sample(0, 0, Some(2)),
            sample(0, 10, Some(20)),
        ])
        .unwrap();
        let bursts = vec![burst(0, 100)];
        let landing: Histogram = [(1, 2), (9, 1)].into_iter().collect();
        let mut per_pc = PcHistograms::new();
        per_pc.insert(0x10, [(1, 2)].into_iter().collect());
        per_pc.insert(0x20, [(9, 1)].into_iter().collect());

        let sd = transform(
            &takeoffs,
            &bursts,
            0,
            &landing,
            &per_pc,
            false,
            &Diagnostics::disabled("test", "statstack"),
        );
        assert_eq!(sd.per_pc[&0x10].to_pairs(), vec![(1, 2)]);
        // 1 + 8 * 0.5
        assert_eq!(sd.per_pc[&0x20].to_pairs(), vec![(5, 1)]);
    }
}
