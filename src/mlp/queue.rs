//! Queuing delay on the memory bus for overlapping DRAM misses.

use std::{fmt, str::FromStr};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueModel {
    /// Misses that overlap queue behind each other's bus transfers.
    Mlp,
    None,
}

impl FromStr for QueueModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MLP" | "mlp" => Ok(QueueModel::Mlp),
            "none" | "None" => Ok(QueueModel::None),
            _ => Err(format!("unknown queue model `{s}` (expected MLP or none)")),
        }
    }
}

impl fmt::Display for QueueModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueModel::Mlp => "MLP",
            QueueModel::None => "none",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    pub model: QueueModel,
    pub bus_transfer_cycles: f64,
    pub rob_size: u64,
    pub dispatch_width: u64,
}

impl QueueParams {
    /// Average bus delay per DRAM miss at the given MLP, interpolating
    /// between the whole numbers of overlapping misses around it.
    pub fn delay(&self, mlp: f64) -> f64 {
        if self.model == QueueModel::None || mlp <= 0.0 {
            return 0.0;
        }
        let down = mlp.floor();
        let fract = mlp - down;
        let down = down as u64;
        ((1.0 - fract) * self.serialized(down) + fract * self.serialized(down + 1)) / mlp
    }

    /// Total wait of `n` misses issued together: each waits for the
    /// transfers before it, minus the dispatch time separating them.
    fn serialized(&self, n: u64) -> f64 {
        if n == 0 {
            return 0.0;
        }
        let bus = self.bus_transfer_cycles;
        let spacing = self.rob_size as f64 / n as f64 / self.dispatch_width as f64;
        (0..n)
            .map(|k| {
                let k = k as f64;
                bus * (k + 1.0) - (bus * k).min(spacing * k)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUS: QueueParams = QueueParams {
        model: QueueModel::Mlp,
        bus_transfer_cycles: 8.0,
        rob_size: 128,
        dispatch_width: 4,
    };

    #[test]
    fn single_miss_waits_one_transfer() {
        assert_eq!(BUS.delay(1.0), 8.0);
    }

    #[test]
    fn overlapping_misses() {
        assert_eq!(BUS.delay(2.0), 8.0);
        assert_eq!(BUS.delay(1.5), 8.0);
        // eight misses dispatched four cycles apart queue behind 8-cycle transfers
        assert_eq!(BUS.delay(8.0), 22.0);
    }

    #[test]
    fn disabled_or_empty() {
        let off = QueueParams {
            model: QueueModel::None,
            ..BUS
        };
        assert_eq!(off.delay(4.0), 0.0);
        assert_eq!(BUS.delay(0.0), 0.0);
    }

    #[test]
    fn parses_names() {
        assert_eq!("MLP".parse::<QueueModel>().unwrap(), QueueModel::Mlp);
        assert_eq!("none".parse::<QueueModel>().unwrap(), QueueModel::None);
        assert!("fifo".parse::<QueueModel>().is_err());
    }
}
