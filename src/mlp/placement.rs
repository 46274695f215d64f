//! Placement of loads and statistically expected misses onto the positions
//! of one micro-trace.

use std::collections::BTreeMap;

use fastrand::Rng;

use crate::{diag::Diagnostics, records::PcProfile, statstack::miss_ratio::MissRatio};

use super::stride::{StrideClass, StrideParams};

/// Trace positions of every reference of `profile`: the first reference,
/// then the observed reuse gaps in random order.
pub fn expand(profile: &PcProfile, rng: &mut Rng) -> Vec<u64> {
    let mut gaps: Vec<u64> = profile
        .reuse
        .iter()
        .flat_map(|&(gap, times)| std::iter::repeat(gap).take(times as usize))
        .collect();
    rng.shuffle(&mut gaps);
    let mut at = profile.first_reference;
    let mut out = Vec::with_capacity(gaps.len() + 1);
    out.push(at);
    for gap in gaps {
        at = at.saturating_add(gap);
        out.push(at);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlacement {
    pub loads: Vec<bool>,
    /// PC of the load at each position, 0 where there is none.
    pub pcs: Vec<u64>,
    /// Where each reference of a PC ended up, in expansion order. `None`
    /// when no free position was left for it.
    pub positions: BTreeMap<u64, Vec<Option<usize>>>,
}

impl LoadPlacement {
    pub fn load_count(&self) -> usize {
        self.loads.iter().filter(|&&l| l).count()
    }
}

fn take_random(free: &mut Vec<usize>, rng: &mut Rng) -> usize {
    let k = rng.usize(..free.len());
    free.remove(k)
}

/// Places the references of every PC on a trace of `len` positions.
/// References that collide with an earlier one, or fall past the end of the
/// trace, go to random free positions.
pub fn place_loads(
    len: usize,
    pcs: &[PcProfile],
    rng: &mut Rng,
    diag: &Diagnostics,
    window: usize,
) -> LoadPlacement {
    let mut placement = LoadPlacement {
        loads: vec![false; len],
        pcs: vec![0; len],
        positions: BTreeMap::new(),
    };
    let mut sorted: Vec<&PcProfile> = pcs.iter().collect();
    sorted.sort_by_key(|p| p.pc);

    let mut conflicts = Vec::new();
    for profile in sorted {
        let mut slots = Vec::new();
        for (i, at) in expand(profile, rng).into_iter().enumerate() {
            let at = at as usize;
            if at < len && !placement.loads[at] {
                placement.loads[at] = true;
                placement.pcs[at] = profile.pc;
                slots.push(Some(at));
            } else {
                slots.push(None);
                conflicts.push((profile.pc, i));
            }
        }
        placement.positions.insert(profile.pc, slots);
    }

    if conflicts.is_empty() {
        return placement;
    }
    let mut free: Vec<usize> = (0..len).filter(|&i| !placement.loads[i]).collect();
    for &(pc, i) in &conflicts {
        if free.is_empty() {
            diag.error(format_args!(
                "window {window}: no free position left for a load of PC {pc:#x}"
            ));
            break;
        }
        let at = take_random(&mut free, rng);
        placement.loads[at] = true;
        placement.pcs[at] = pc;
        if let Some(slot) = placement.positions.get_mut(&pc).and_then(|s| s.get_mut(i)) {
            *slot = Some(at);
        }
    }
    diag.info(format_args!(
        "window {window}: placed {} loads randomly for a total of {} loads",
        conflicts.len(),
        placement.load_count()
    ));
    placement
}

/// Miss weight at one trace position: 1 for a certain miss, the PC's miss
/// ratio for references of irregular PCs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MissSlot {
    pub value: f64,
    pub prefetchable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClassCounts {
    pub strided: u64,
    pub single: u64,
    pub irregular: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissPlacement {
    pub slots: Vec<MissSlot>,
    /// Misses the per-PC miss ratios predict for the trace.
    pub expected: u64,
    pub classes: ClassCounts,
    pub randomly_placed: f64,
}

impl MissPlacement {
    pub fn placed(&self) -> f64 {
        self.slots.iter().map(|s| s.value).sum()
    }
}

/// Adds a fractional miss to a position, or reports that it is full.
fn add_fraction(slot: &mut MissSlot, ratio: f64) -> bool {
    if slot.value == 0.0 {
        *slot = MissSlot {
            value: ratio,
            prefetchable: false,
        };
        true
    } else if slot.value < 1.0 - ratio {
        slot.value += ratio;
        true
    } else {
        false
    }
}

/// Distributes each PC's expected LLC misses over the positions of its
/// references.
///
/// Strided PCs miss on the earliest references their pattern marks as
/// misses. Irregular PCs get their miss ratio on every reference. Misses
/// that find their position taken, and strided misses the pattern cannot
/// account for, are placed on random loads without a miss.
pub fn place_misses(
    loads: &LoadPlacement,
    pcs: &[PcProfile],
    llc_ratios: &BTreeMap<u64, MissRatio>,
    stride: &StrideParams,
    rng: &mut Rng,
    diag: &Diagnostics,
    window: usize,
) -> MissPlacement {
    let mut out = MissPlacement {
        slots: vec![MissSlot::default(); loads.loads.len()],
        expected: 0,
        classes: ClassCounts::default(),
        randomly_placed: 0.0,
    };
    let mut sorted: Vec<&PcProfile> = pcs.iter().collect();
    sorted.sort_by_key(|p| p.pc);
    let no_positions = Vec::new();

    for profile in sorted {
        let pattern = stride.classify(&profile.strides);
        let ratio = llc_ratios.get(&profile.pc).copied().unwrap_or_default();
        let expected = (ratio.ratio * ratio.refs as f64).round() as u64;
        out.expected += expected;
        let positions = loads.positions.get(&profile.pc).unwrap_or(&no_positions);

        let mut conflicts = 0u64;
        let mut shortfall = 0u64;
        let fill = match pattern.class {
            StrideClass::Strided => {
                out.classes.strided += 1;
                if expected > 0 {
                    let mut placed = 0u64;
                    for (i, _) in pattern.misses.iter().enumerate().filter(|&(_, &m)| m) {
                        if placed >= expected {
                            break;
                        }
                        match positions.get(i).copied().flatten() {
                            Some(at) if out.slots[at].value == 0.0 => {
                                out.slots[at] = MissSlot {
                                    value: 1.0,
                                    prefetchable: pattern.prefetchable[i],
                                };
                            }
                            _ => conflicts += 1,
                        }
                        placed += 1;
                    }
                    shortfall = expected - placed;
                }
                1.0
            }
            StrideClass::Single => {
                out.classes.single += 1;
                if expected > 0 {
                    match positions.first().copied().flatten() {
                        Some(at) if add_fraction(&mut out.slots[at], ratio.ratio) => {}
                        _ => conflicts += 1,
                    }
                }
                ratio.ratio
            }
            StrideClass::Irregular => {
                out.classes.irregular += 1;
                if expected > 0 {
                    for at in positions {
                        match at {
                            Some(at) if add_fraction(&mut out.slots[*at], ratio.ratio) => {}
                            _ => conflicts += 1,
                        }
                    }
                }
                ratio.ratio
            }
        };

        let extra = conflicts + shortfall;
        if extra == 0 {
            continue;
        }
        out.randomly_placed += extra as f64 * fill;
        let mut free: Vec<usize> = (0..out.slots.len())
            .filter(|&i| out.slots[i].value == 0.0 && loads.loads[i])
            .collect();
        if free.len() < extra as usize {
            diag.error(format_args!(
                "window {window}: too few free positions for {extra} random misses of PC {:#x}",
                profile.pc
            ));
            continue;
        }
        for _ in 0..extra {
            let at = take_random(&mut free, rng);
            out.slots[at] = MissSlot {
                value: fill,
                prefetchable: false,
            };
        }
    }

    let c = out.classes;
    diag.info(format_args!(
        "window {window}: {} strided, {} single and {} irregular PCs",
        c.strided, c.single, c.irregular
    ));
    diag.info(format_args!(
        "window {window}: placed {} misses randomly for a total of {} misses",
        out.randomly_placed,
        out.placed()
    ));
    out
}
