use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    Data,
    Instructions,
    Both,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    pub name: String,
    pub level: u32,
    pub content: Content,
    pub size_kb: u64,
    pub line_size: u64,
    pub data_access_time: f64,
    pub tag_time: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoreConfig {
    pub window_size: u64,
    pub dispatch_width: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MshrConfig {
    pub entries: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DramConfig {
    pub data_access_time: f64,
    pub page_size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BusConfig {
    pub transfer_cycles: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PrefetcherConfig {
    #[serde(default)]
    pub prefetch_in_page: bool,
    #[serde(default = "default_flows")]
    pub flows: usize,
}

fn default_flows() -> usize {
    16
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        PrefetcherConfig {
            prefetch_in_page: false,
            flows: default_flows(),
        }
    }
}

/// Processor description as read from the JSON configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,
    pub caches: Vec<CacheConfig>,
    pub mshr: MshrConfig,
    pub dram: DramConfig,
    pub bus: BusConfig,
    #[serde(default)]
    pub prefetcher: PrefetcherConfig,
}

impl Config {
    pub fn from_path(path: &Path, overrides: &[String]) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_str_with(&text, overrides)
    }

    /// Parses `text` and applies `STRUCTURE/parameter=value` overrides, where
    /// the structure is a top-level section or the name of a cache.
    pub fn from_str_with(text: &str, overrides: &[String]) -> Result<Config, ConfigError> {
        let mut value: Value = serde_json::from_str(text)?;
        for ov in overrides {
            apply_override(&mut value, ov)?;
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let path = dir.join("used_config.json");
        let file = fs::File::create(&path).map_err(|source| ConfigError::Io { path, source })?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn to_machine(&self) -> Result<Machine, ConfigError> {
        if self.core.window_size == 0 {
            return Err(ConfigError::Zero("core/window_size"));
        }
        if self.core.dispatch_width == 0 {
            return Err(ConfigError::Zero("core/dispatch_width"));
        }
        if self.mshr.entries == 0 {
            return Err(ConfigError::Zero("mshr/entries"));
        }
        let has_l1d = self
            .caches
            .iter()
            .any(|c| c.level == 1 && matches!(c.content, Content::Data | Content::Both));
        if !has_l1d {
            return Err(ConfigError::MissingL1Data);
        }
        let line_size = self.caches[0].line_size;
        if let Some(other) = self.caches.iter().find(|c| c.line_size != line_size) {
            return Err(ConfigError::InconsistentLineSize {
                first: line_size,
                second: other.line_size,
            });
        }
        if line_size == 0 {
            return Err(ConfigError::Zero("line_size"));
        }

        let mut data: Vec<&CacheConfig> = self
            .caches
            .iter()
            .filter(|c| c.content != Content::Instructions)
            .collect();
        data.sort_by_key(|c| c.size_kb);

        let tags: Vec<f64> = data.iter().map(|c| c.tag_time).collect();
        let tag_sum: f64 = tags.iter().sum();
        let dram_miss = tag_sum + self.dram.data_access_time + self.bus.transfer_cycles;
        let levels = data
            .iter()
            .enumerate()
            .map(|(i, c)| DataLevel {
                name: c.name.clone(),
                size: c.size_kb * 1024,
                access_cost: tags[..i].iter().sum::<f64>() + c.data_access_time,
                miss_cost: match data.get(i + 1) {
                    Some(next) => tags[..=i].iter().sum::<f64>() + next.data_access_time,
                    None => dram_miss,
                },
            })
            .collect();
        let mut instruction_sizes: Vec<u64> = self
            .caches
            .iter()
            .filter(|c| c.content != Content::Data)
            .map(|c| c.size_kb * 1024)
            .collect();
        instruction_sizes.sort_unstable();

        Ok(Machine {
            rob_size: self.core.window_size,
            dispatch_width: self.core.dispatch_width,
            mshr_entries: self.mshr.entries,
            line_size,
            levels,
            instruction_sizes,
            dram_latency_with_tag: dram_miss,
            bus_transfer_cycles: self.bus.transfer_cycles,
            page_half: self.dram.page_size / 2,
            prefetch_in_page: self.prefetcher.prefetch_in_page,
            prefetcher_flows: self.prefetcher.flows,
        })
    }
}

fn apply_override(config: &mut Value, ov: &str) -> Result<(), ConfigError> {
    let syntax = || ConfigError::OverrideSyntax(ov.to_string());
    let (structure, rest) = ov.split_once('/').ok_or_else(syntax)?;
    let (parameter, raw) = rest.split_once('=').ok_or_else(syntax)?;
    let new_value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let section = if config.get(structure).is_some() {
        config.get_mut(structure)
    } else {
        config
            .get_mut("caches")
            .and_then(Value::as_array_mut)
            .and_then(|caches| {
                caches
                    .iter_mut()
                    .find(|c| c.get("name").and_then(Value::as_str) == Some(structure))
            })
    };
    let section = section
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ConfigError::UnknownStructure(structure.to_string()))?;
    match section.get_mut(parameter) {
        Some(slot) => {
            *slot = new_value;
            Ok(())
        }
        None => Err(ConfigError::UnknownParameter {
            structure: structure.to_string(),
            parameter: parameter.to_string(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataLevel {
    pub name: String,
    /// Capacity in bytes.
    pub size: u64,
    /// Cycles to hit in this level, including the tag checks of the levels above.
    pub access_cost: f64,
    /// Cycles to service a miss in this level from the level below it.
    pub miss_cost: f64,
}

/// Validated machine parameters with derived latencies.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub rob_size: u64,
    pub dispatch_width: u64,
    pub mshr_entries: u64,
    pub line_size: u64,
    /// Data cache levels, smallest first.
    pub levels: Vec<DataLevel>,
    /// Capacities of the caches holding instructions, smallest first.
    pub instruction_sizes: Vec<u64>,
    pub dram_latency_with_tag: f64,
    pub bus_transfer_cycles: f64,
    /// Half a DRAM page: a stride at least this large leaves the page.
    pub page_half: u64,
    pub prefetch_in_page: bool,
    pub prefetcher_flows: usize,
}

impl Machine {
    pub fn cache_sizes(&self) -> Vec<u64> {
        self.levels.iter().map(|l| l.size).collect()
    }

    pub fn llc(&self) -> &DataLevel {
        &self.levels[self.levels.len() - 1]
    }

    pub fn llc_miss_cost(&self) -> f64 {
        self.llc().miss_cost
    }

    pub fn lines(&self, size: u64) -> u64 {
        size / self.line_size
    }
}
