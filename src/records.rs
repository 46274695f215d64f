//! Record types carried in the profiler's streams and in the stack-distance
//! cache files.

use serde::Serialize;

use crate::{
    error::TraceError,
    trace::{put_pairs, put_varint, Fields, Record},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Load,
    Store,
}

impl AccessKind {
    pub fn from_code(code: u64) -> Result<Self, TraceError> {
        match code {
            0 => Ok(AccessKind::Load),
            1 => Ok(AccessKind::Store),
            other => Err(TraceError::UnknownAccessType(other)),
        }
    }

    pub fn code(self) -> u64 {
        match self {
            AccessKind::Load => 0,
            AccessKind::Store => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub burst_id: usize,
    pub access_counter: u64,
    pub program_counter: u64,
    pub memory_address: u64,
    pub access_type: AccessKind,
    pub thread_id: u64,
}

impl AccessEvent {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        Ok(AccessEvent {
            burst_id: fields.next_usize()?,
            access_counter: fields.next()?,
            program_counter: fields.next()?,
            memory_address: fields.next()?,
            access_type: AccessKind::from_code(fields.next()?)?,
            thread_id: fields.next()?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.burst_id as u64);
        put_varint(out, self.access_counter);
        put_varint(out, self.program_counter);
        put_varint(out, self.memory_address);
        put_varint(out, self.access_type.code());
        put_varint(out, self.thread_id);
    }
}

/// A sampled access, paired with its reuse when one was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub begin: AccessEvent,
    pub end: Option<AccessEvent>,
}

impl Sample {
    /// Accesses between the two halves of the pair; `None` for dangling samples.
    pub fn reuse_distance(&self) -> Option<u64> {
        self.end
            .map(|end| end.access_counter.saturating_sub(self.begin.access_counter + 1))
    }
}

impl Record for Sample {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        let begin = AccessEvent::decode(fields)?;
        let end = if fields.is_empty() {
            None
        } else {
            Some(AccessEvent::decode(fields)?)
        };
        Ok(Sample { begin, end })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.begin.encode(out);
        if let Some(end) = &self.end {
            end.encode(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Burst {
    pub instr_begin: u64,
    pub instr_end: u64,
    pub memaccess_begin: u64,
    pub memaccess_end: u64,
    pub takeoff_loads: u64,
    pub takeoff_stores: u64,
    pub landing_loads: u64,
    pub landing_stores: u64,
}

impl Burst {
    pub fn instructions(&self) -> u64 {
        self.instr_end.saturating_sub(self.instr_begin)
    }
}

impl Record for Burst {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        Ok(Burst {
            instr_begin: fields.next()?,
            instr_end: fields.next()?,
            memaccess_begin: fields.next()?,
            memaccess_end: fields.next()?,
            takeoff_loads: fields.next()?,
            takeoff_stores: fields.next()?,
            landing_loads: fields.next()?,
            landing_stores: fields.next()?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        for v in [
            self.instr_begin,
            self.instr_end,
            self.memaccess_begin,
            self.memaccess_end,
            self.takeoff_loads,
            self.takeoff_stores,
            self.landing_loads,
            self.landing_stores,
        ] {
            put_varint(out, v);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TraceCounters {
    pub instructions: u64,
    pub micro_ops: u64,
    pub loads: u64,
    pub stores: u64,
}

/// Load dependence chain lengths observed for one reorder-window size.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainStats {
    pub rob_size: u64,
    pub frequency: Vec<u64>,
}

/// Per-PC reuse and stride profile of one micro-trace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcProfile {
    pub pc: u64,
    pub first_reference: u64,
    /// `(reuse gap in trace positions, times)`
    pub reuse: Vec<(u64, u64)>,
    pub first_address: u64,
    /// `(stride in bytes, times)`
    pub strides: Vec<(i64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MlpWindow {
    pub counters: TraceCounters,
    pub chain_stats: Vec<ChainStats>,
    pub pcs: Vec<PcProfile>,
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

impl Record for MlpWindow {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        let counters = TraceCounters {
            instructions: fields.next()?,
            micro_ops: fields.next()?,
            loads: fields.next()?,
            stores: fields.next()?,
        };
        let chains = fields.next_usize()?;
        let mut chain_stats = Vec::new();
        for _ in 0..chains {
            let rob_size = fields.next()?;
            let len = fields.next_usize()?;
            let frequency = (0..len).map(|_| fields.next()).collect::<Result<_, _>>()?;
            chain_stats.push(ChainStats {
                rob_size,
                frequency,
            });
        }
        let n_pcs = fields.next_usize()?;
        let mut pcs = Vec::new();
        for _ in 0..n_pcs {
            let pc = fields.next()?;
            let first_reference = fields.next()?;
            let reuse = fields.pairs()?;
            let first_address = fields.next()?;
            let strides = fields
                .pairs()?
                .into_iter()
                .map(|(s, t)| (unzigzag(s), t))
                .collect();
            pcs.push(PcProfile {
                pc,
                first_reference,
                reuse,
                first_address,
                strides,
            });
        }
        Ok(MlpWindow {
            counters,
            chain_stats,
            pcs,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let c = &self.counters;
        for v in [c.instructions, c.micro_ops, c.loads, c.stores] {
            put_varint(out, v);
        }
        put_varint(out, self.chain_stats.len() as u64);
        for chain in &self.chain_stats {
            put_varint(out, chain.rob_size);
            put_varint(out, chain.frequency.len() as u64);
            for &f in &chain.frequency {
                put_varint(out, f);
            }
        }
        put_varint(out, self.pcs.len() as u64);
        for pc in &self.pcs {
            put_varint(out, pc.pc);
            put_varint(out, pc.first_reference);
            put_pairs(out, &pc.reuse);
            put_varint(out, pc.first_address);
            let strides: Vec<_> = pc.strides.iter().map(|&(s, t)| (zigzag(s), t)).collect();
            put_pairs(out, &strides);
        }
    }
}

/// Distribution of cold misses per reorder window for one
/// (window size, line size) combination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColdDistribution {
    pub rob_size: u64,
    pub cacheblock_size: u64,
    /// `(misses in the window, occurrences)`
    pub misses: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColdWindow {
    pub distributions: Vec<ColdDistribution>,
}

impl ColdWindow {
    pub fn distribution(&self, rob_size: u64, cacheblock_size: u64) -> Option<&[(u64, u64)]> {
        self.distributions
            .iter()
            .find(|d| d.rob_size == rob_size && d.cacheblock_size == cacheblock_size)
            .map(|d| d.misses.as_slice())
    }
}

impl Record for ColdWindow {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        let len = fields.next_usize()?;
        let mut distributions = Vec::new();
        for _ in 0..len {
            distributions.push(ColdDistribution {
                rob_size: fields.next()?,
                cacheblock_size: fields.next()?,
                misses: fields.pairs()?,
            });
        }
        Ok(ColdWindow { distributions })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.distributions.len() as u64);
        for d in &self.distributions {
            put_varint(out, d.rob_size);
            put_varint(out, d.cacheblock_size);
            put_pairs(out, &d.misses);
        }
    }
}

/// One persisted stack-distance histogram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdHistRecord {
    pub burst_id: usize,
    pub counts: Vec<(u64, u64)>,
}

impl Record for SdHistRecord {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        Ok(SdHistRecord {
            burst_id: fields.next_usize()?,
            counts: fields.pairs()?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.burst_id as u64);
        put_pairs(out, &self.counts);
    }
}

/// Persisted per-PC stack-distance histograms of one burst.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcSdHistRecord {
    pub burst_id: usize,
    pub pcs: Vec<(u64, Vec<(u64, u64)>)>,
}

impl Record for PcSdHistRecord {
    fn decode(fields: &mut Fields<'_>) -> Result<Self, TraceError> {
        let burst_id = fields.next_usize()?;
        let len = fields.next_usize()?;
        let pcs = (0..len)
            .map(|_| Ok((fields.next()?, fields.pairs()?)))
            .collect::<Result<_, TraceError>>()?;
        Ok(PcSdHistRecord { burst_id, pcs })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint(out, self.burst_id as u64);
        put_varint(out, self.pcs.len() as u64);
        for (pc, counts) in &self.pcs {
            put_varint(out, *pc);
            put_pairs(out, counts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(burst_id: usize, access_counter: u64, access_type: AccessKind) -> AccessEvent {
        AccessEvent {
            burst_id,
            access_counter,
            program_counter: 0x400000,
            memory_address: 0x7fff_0000,
            access_type,
            thread_id: 0,
        }
    }

    #[test]
    fn dangling_and_paired_samples_decode() {
        let paired = Sample {
            begin: event(1, 10, AccessKind::Load),
            end: Some(event(2, 14, AccessKind::Store)),
        };
        let dangling = Sample {
            begin: event(3, 20, AccessKind::Store),
            end: None,
        };
        for sample in [paired, dangling] {
            let mut buf = Vec::new();
            sample.encode(&mut buf);
            let decoded = Sample::decode(&mut Fields::new(&buf)).unwrap();
            assert_eq!(decoded, sample);
        }
        assert_eq!(paired.reuse_distance(), Some(3));
        assert_eq!(dangling.reuse_distance(), None);
    }

    #[test]
    fn unknown_access_type_is_rejected() {
        let mut buf = Vec::new();
        for v in [0, 1, 2, 3, 7, 0] {
            put_varint(&mut buf, v);
        }
        assert!(matches!(
            Sample::decode(&mut Fields::new(&buf)),
            Err(TraceError::UnknownAccessType(7))
        ));
    }

    #[test]
    fn negative_strides_survive_encoding() {
        let window = MlpWindow {
            pcs: vec![PcProfile {
                pc: 1,
                strides: vec![(-64, 3), (8, 10)],
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut buf = Vec::new();
        window.encode(&mut buf);
        assert_eq!(MlpWindow::decode(&mut Fields::new(&buf)).unwrap(), window);
    }

    #[test]
    fn cold_distribution_lookup() {
        let cold = ColdWindow {
            distributions: vec![
                ColdDistribution {
                    rob_size: 128,
                    cacheblock_size: 64,
                    misses: vec![(1, 4)],
                },
                ColdDistribution {
                    rob_size: 256,
                    cacheblock_size: 64,
                    misses: vec![(2, 5)],
                },
            ],
        };
        assert_eq!(cold.distribution(256, 64), Some(&[(2, 5)][..]));
        assert_eq!(cold.distribution(256, 32), None);
    }

    #[test]
    fn oversized_counts_are_short_payloads() {
        let mut buf = Vec::new();
        for v in [1, 1, 1, 0, 1 << 62] {
            put_varint(&mut buf, v);
        }
        assert!(matches!(
            MlpWindow::decode(&mut Fields::new(&buf)),
            Err(TraceError::ShortPayload { .. })
        ));

        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert!(matches!(
            ColdWindow::decode(&mut Fields::new(&buf)),
            Err(TraceError::ShortPayload { .. })
        ));

        let mut buf = Vec::new();
        for v in [1, 1, 1, 0, 0, 1 << 40] {
            put_varint(&mut buf, v);
        }
        assert!(matches!(
            MlpWindow::decode(&mut Fields::new(&buf)),
            Err(TraceError::ShortPayload { .. })
        ));
    }
}
