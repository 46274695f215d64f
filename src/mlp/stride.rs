//! Per-PC stride classification and the deterministic miss pattern it
//! implies.

/// Reference coverage the `k` most frequent strides need to make a PC
/// count as strided with `k` strides.
const COVERAGE: [f64; 4] = [0.60, 0.70, 0.80, 0.90];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrideClass {
    /// Referenced once in the trace; no stride was observed.
    Single,
    /// Up to four strides cover enough references.
    Strided,
    /// No small set of strides explains the references.
    Irregular,
}

/// Which references of one PC miss in a cold cache, and which of those a
/// stride prefetcher could cover. Index 0 is the first reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcPattern {
    pub class: StrideClass,
    pub misses: Vec<bool>,
    pub prefetchable: Vec<bool>,
}

/// Miss pattern of `refs` accesses, each `stride` bytes after the previous
/// one, starting half a line into a cache line.
pub fn stride_misses(stride: u64, refs: u64, line_size: u64) -> Vec<bool> {
    if stride == 0 {
        return vec![false; refs as usize];
    }
    if stride >= line_size {
        return vec![true; refs as usize];
    }
    let mut offset = stride + line_size / 2;
    let mut next_line = line_size;
    (0..refs)
        .map(|_| {
            let miss = offset >= next_line;
            if miss {
                next_line += line_size;
            }
            offset += stride;
            miss
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct StrideParams {
    pub line_size: u64,
    /// Strides of at least this many bytes leave the DRAM page.
    pub page_half: u64,
    /// The prefetcher does not cross page boundaries.
    pub prefetch_in_page: bool,
}

impl StrideParams {
    pub fn classify(&self, strides: &[(i64, u64)]) -> PcPattern {
        let mut strides = strides.to_vec();
        strides.sort_unstable();
        match strides.len() {
            0 => PcPattern {
                class: StrideClass::Single,
                misses: vec![true],
                prefetchable: vec![false],
            },
            1 => self.strided(&strides, 0),
            _ => {
                strides.sort_by(|a, b| b.1.cmp(&a.1));
                let references: u64 = strides.iter().map(|s| s.1).sum();
                for (k, &coverage) in COVERAGE.iter().enumerate() {
                    let top = &strides[..strides.len().min(k + 1)];
                    let covered: u64 = top.iter().map(|s| s.1).sum();
                    if covered as f64 / references as f64 >= coverage {
                        return self.strided(top, references - covered);
                    }
                }
                let n = references as usize + 1;
                PcPattern {
                    class: StrideClass::Irregular,
                    misses: vec![true; n],
                    prefetchable: vec![false; n],
                }
            }
        }
    }

    /// Patterns of `strides` back to back, then `outliers` references that
    /// always miss.
    fn strided(&self, strides: &[(i64, u64)], outliers: u64) -> PcPattern {
        let mut misses = vec![true];
        let mut prefetchable = vec![false];
        for &(stride, refs) in strides {
            let stride = stride.unsigned_abs();
            let pattern = stride_misses(stride, refs, self.line_size);
            if self.prefetch_in_page && stride > self.page_half {
                prefetchable.extend(std::iter::repeat(false).take(refs as usize));
            } else {
                prefetchable.extend_from_slice(&pattern);
            }
            misses.extend(pattern);
        }
        misses.extend(std::iter::repeat(true).take(outliers as usize));
        prefetchable.extend(std::iter::repeat(false).take(outliers as usize));
        PcPattern {
            class: StrideClass::Strided,
            misses,
            prefetchable,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PARAMS: StrideParams = StrideParams {
        line_size: 64,
        page_half: 2048,
        prefetch_in_page: false,
    };

    fn positions(bits: &[bool]) -> Vec<usize> {
        bits.iter()
            .enumerate()
            .filter(|&(_, &b)| b)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn one_miss_per_line() {
        let pattern = PARAMS.classify(&[(8, 100)]);
        assert_eq!(pattern.class, StrideClass::Strided);
        assert_eq!(pattern.misses.len(), 101);
        let expected: Vec<usize> = std::iter::once(0).chain((4..=100).step_by(8)).collect();
        assert_eq!(positions(&pattern.misses), expected);
        // every line crossing can be prefetched, the first touch cannot
        assert_eq!(&pattern.prefetchable[1..], &pattern.misses[1..]);
        assert!(!pattern.prefetchable[0]);
    }

    #[test]
    fn degenerate_strides() {
        assert_eq!(stride_misses(0, 3, 64), vec![false; 3]);
        assert_eq!(stride_misses(64, 3, 64), vec![true; 3]);
        assert_eq!(stride_misses(200, 2, 64), vec![true; 2]);
        assert_eq!(PARAMS.classify(&[(-8, 100)]), PARAMS.classify(&[(8, 100)]));
    }

    #[test]
    fn page_crossing_strides() {
        let in_page = StrideParams {
            prefetch_in_page: true,
            ..PARAMS
        };
        let pattern = in_page.classify(&[(4096, 10)]);
        assert_eq!(pattern.misses, vec![true; 11]);
        assert_eq!(pattern.prefetchable, vec![false; 11]);

        let pattern = PARAMS.classify(&[(4096, 10)]);
        assert_eq!(positions(&pattern.prefetchable), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn half_page_stride_stays_in_page() {
        let in_page = StrideParams {
            prefetch_in_page: true,
            ..PARAMS
        };
        let half = in_page.classify(&[(2048, 10)]);
        assert_eq!(positions(&half.prefetchable), (1..=10).collect::<Vec<_>>());

        let over = in_page.classify(&[(2049, 10)]);
        assert_eq!(over.misses, vec![true; 11]);
        assert_eq!(over.prefetchable, vec![false; 11]);
    }

    #[test]
    fn coverage_thresholds() {
        let pattern = PARAMS.classify(&[(64, 35), (8, 65)]);
        assert_eq!(pattern.class, StrideClass::Strided);
        assert_eq!(pattern.misses.len(), 101);
        // outliers come last and always miss
        assert!(pattern.misses[66..].iter().all(|&m| m));
        assert!(pattern.prefetchable[66..].iter().all(|&p| !p));

        let three = PARAMS.classify(&[(8, 40), (16, 20), (24, 20), (32, 10), (40, 10)]);
        assert_eq!(three.class, StrideClass::Strided);
        assert_eq!(three.misses.len(), 101);

        let irregular = PARAMS.classify(&[(8, 20), (16, 20), (24, 20), (32, 20), (40, 20)]);
        assert_eq!(irregular.class, StrideClass::Irregular);
        assert_eq!(irregular.misses, vec![true; 101]);
        assert_eq!(irregular.prefetchable, vec![false; 101]);
    }

    #[test]
    fn single_reference() {
        let pattern = PARAMS.classify(&[]);
        assert_eq!(pattern.class, StrideClass::Single);
        assert_eq!(pattern.misses, vec![true]);
    }

    #[test]
    fn classification_is_deterministic() {
        let strides = [(24, 7), (8, 30), (-16, 30), (4096, 3)];
        assert_eq!(PARAMS.classify(&strides), PARAMS.classify(&strides));
    }
}
