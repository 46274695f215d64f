use std::collections::BTreeMap;

/// Distance of a cold (never reused) access.
pub const INFINITE: u64 = u64::MAX;

/// Occurrence counts keyed by reuse or stack distance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram(BTreeMap<u64, u64>);

impl Histogram {
    pub fn new() -> Self {
        Histogram(BTreeMap::new())
    }

    pub fn add(&mut self, distance: u64, count: u64) {
        *self.0.entry(distance).or_insert(0) += count;
    }

    pub fn get(&self, distance: u64) -> u64 {
        self.0.get(&distance).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (&d, &c) in &other.0 {
            self.add(d, c);
        }
    }

    /// `(distance, count)` in ascending distance order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.0.iter().map(|(&d, &c)| (d, c))
    }

    pub fn to_pairs(&self) -> Vec<(u64, u64)> {
        self.iter().collect()
    }
}

impl FromIterator<(u64, u64)> for Histogram {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut hist = Histogram::new();
        for (d, c) in iter {
            hist.add(d, c);
        }
        hist
    }
}

/// Histograms of one burst split by the PC of the takeoff access.
pub type PcHistograms = BTreeMap<u64, Histogram>;
