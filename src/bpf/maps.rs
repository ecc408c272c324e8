//! Map plumbing shared by the loader and the lifecycle controller: zero
//! seeding of monitor maps, config writes driven by map-args, and the
//! ring-buffered metric samples published from monitor maps.

use std::collections::VecDeque;

use aya::maps::{Array, HashMap as AyaHashMap, Map, MapData, MapError};
use aya::Ebpf;
use aya::Pod;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::model::MonitorMapSpec;

/// Record of a config map owned by a loaded program, kept for map-args
/// updates and for the cleanup verification that its kernel id vanishes
/// after unload.
#[derive(Debug, Clone)]
pub struct BpfMap {
    pub name: String,
    pub id: u32,
}

/// Borrow the raw map data out of any [`Map`] variant.
pub fn map_data(map: &Map) -> &MapData {
    match map {
        Map::Array(d)
        | Map::BloomFilter(d)
        | Map::CpuMap(d)
        | Map::DevMap(d)
        | Map::DevMapHash(d)
        | Map::HashMap(d)
        | Map::LpmTrie(d)
        | Map::LruHashMap(d)
        | Map::PerCpuArray(d)
        | Map::PerCpuHashMap(d)
        | Map::PerCpuLruHashMap(d)
        | Map::PerfEventArray(d)
        | Map::ProgramArray(d)
        | Map::Queue(d)
        | Map::RingBuf(d)
        | Map::SockHash(d)
        | Map::SockMap(d)
        | Map::Stack(d)
        | Map::StackTraceMap(d)
        | Map::XskMap(d) => d,
        Map::Unsupported(d) => d,
    }
}

/// Kernel id of a loaded map, if the kernel reports one.
pub fn map_id(map: &Map) -> Option<u32> {
    map_data(map).info().ok().map(|info| info.id())
}

/// Seed every declared monitor map with a zero entry at key 0 so the first
/// metrics read observes a defined value. Key/value widths of 1, 2, 4, and 8
/// bytes are supported; anything else is logged and skipped.
pub fn seed_monitor_maps(ebpf: &mut Ebpf, monitor_maps: &[MonitorMapSpec], program: &str) -> Result<()> {
    for spec in monitor_maps {
        let Some(map) = ebpf.map_mut(&spec.name) else {
            warn!(program, map = %spec.name, "monitor map not present in object, skipping seed");
            continue;
        };

        let info = match map_data(map).info() {
            Ok(info) => info,
            Err(e) => {
                warn!(program, map = %spec.name, error = %e, "monitor map info unavailable");
                continue;
            }
        };
        let (key_size, value_size) = (info.key_size(), info.value_size());

        let seeded = match map {
            Map::Array(_) => seed_array_cell(map, value_size),
            Map::HashMap(_) => seed_hash_cell(map, key_size, value_size),
            _ => {
                warn!(program, map = %spec.name, "unsupported monitor map type, skipping seed");
                continue;
            }
        };

        match seeded {
            Ok(true) => debug!(program, map = %spec.name, "seeded monitor map"),
            Ok(false) => warn!(
                program,
                map = %spec.name,
                key_size,
                value_size,
                "unsupported monitor map widths, skipping seed"
            ),
            Err(e) => {
                return Err(Error::MapUpdateFailed {
                    map: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn seed_array_cell(map: &mut Map, value_size: u32) -> Result<bool, MapError> {
    match value_size {
        1 => set_array::<u8>(map, 0, 0),
        2 => set_array::<u16>(map, 0, 0),
        4 => set_array::<u32>(map, 0, 0),
        8 => set_array::<u64>(map, 0, 0),
        _ => return Ok(false),
    }
    .map(|()| true)
}

fn seed_hash_cell(map: &mut Map, key_size: u32, value_size: u32) -> Result<bool, MapError> {
    let result = match (key_size, value_size) {
        (1, 1) => insert_hash::<u8, u8>(map, 0, 0),
        (1, 2) => insert_hash::<u8, u16>(map, 0, 0),
        (1, 4) => insert_hash::<u8, u32>(map, 0, 0),
        (1, 8) => insert_hash::<u8, u64>(map, 0, 0),
        (2, 1) => insert_hash::<u16, u8>(map, 0, 0),
        (2, 2) => insert_hash::<u16, u16>(map, 0, 0),
        (2, 4) => insert_hash::<u16, u32>(map, 0, 0),
        (2, 8) => insert_hash::<u16, u64>(map, 0, 0),
        (4, 1) => insert_hash::<u32, u8>(map, 0, 0),
        (4, 2) => insert_hash::<u32, u16>(map, 0, 0),
        (4, 4) => insert_hash::<u32, u32>(map, 0, 0),
        (4, 8) => insert_hash::<u32, u64>(map, 0, 0),
        (8, 1) => insert_hash::<u64, u8>(map, 0, 0),
        (8, 2) => insert_hash::<u64, u16>(map, 0, 0),
        (8, 4) => insert_hash::<u64, u32>(map, 0, 0),
        (8, 8) => insert_hash::<u64, u64>(map, 0, 0),
        _ => return Ok(false),
    };
    result.map(|()| true)
}

fn set_array<V: Pod + TryFrom<u64>>(map: &mut Map, index: u32, value: u64) -> Result<(), MapError> {
    let mut array: Array<_, V> = Array::try_from(map)?;
    let value = V::try_from(value).map_err(|_| MapError::OutOfBounds {
        index,
        max_entries: 0,
    })?;
    array.set(index, value, 0)
}

fn insert_hash<K, V>(map: &mut Map, key: u64, value: u64) -> Result<(), MapError>
where
    K: Pod + TryFrom<u64>,
    V: Pod + TryFrom<u64>,
{
    let mut hash: AyaHashMap<_, K, V> = AyaHashMap::try_from(map)?;
    let key = K::try_from(key).map_err(|_| MapError::OutOfBounds {
        index: 0,
        max_entries: 0,
    })?;
    let value = V::try_from(value).map_err(|_| MapError::OutOfBounds {
        index: 0,
        max_entries: 0,
    })?;
    hash.insert(key, value, 0)
}

/// Write a numeric config value into a program-owned map at the given key.
/// Used for map-args updates; the string value must parse as an unsigned
/// integer.
pub fn write_map_cell(map: &mut Map, map_name: &str, key: u32, raw: &str) -> Result<()> {
    let value: u64 = raw.trim().parse().map_err(|_| Error::MapUpdateFailed {
        map: map_name.to_string(),
        reason: format!("value {raw:?} is not an unsigned integer"),
    })?;

    let info = map_data(map).info().map_err(|e| Error::MapLookupFailed {
        map: map_name.to_string(),
        reason: e.to_string(),
    })?;
    let (key_size, value_size) = (info.key_size(), info.value_size());

    let written = match map {
        Map::Array(_) => match value_size {
            1 => set_array::<u8>(map, key, value).map(|()| true),
            2 => set_array::<u16>(map, key, value).map(|()| true),
            4 => set_array::<u32>(map, key, value).map(|()| true),
            8 => set_array::<u64>(map, key, value).map(|()| true),
            _ => Ok(false),
        },
        Map::HashMap(_) => match (key_size, value_size) {
            (4, 1) => insert_hash::<u32, u8>(map, key.into(), value).map(|()| true),
            (4, 2) => insert_hash::<u32, u16>(map, key.into(), value).map(|()| true),
            (4, 4) => insert_hash::<u32, u32>(map, key.into(), value).map(|()| true),
            (4, 8) => insert_hash::<u32, u64>(map, key.into(), value).map(|()| true),
            _ => Ok(false),
        },
        _ => Ok(false),
    };

    match written {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::MapUpdateFailed {
            map: map_name.to_string(),
            reason: format!("unsupported map shape (key {key_size}B, value {value_size}B)"),
        }),
        Err(e) => Err(Error::MapUpdateFailed {
            map: map_name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Read a numeric cell from a program-owned map, widening to u64.
pub fn read_map_cell(map: &mut Map, map_name: &str, key: u32) -> Result<u64> {
    let info = map_data(map).info().map_err(|e| Error::MapLookupFailed {
        map: map_name.to_string(),
        reason: e.to_string(),
    })?;
    let (key_size, value_size) = (info.key_size(), info.value_size());

    let read = match map {
        Map::Array(_) => match value_size {
            1 => get_array::<u8>(map, key),
            2 => get_array::<u16>(map, key),
            4 => get_array::<u32>(map, key),
            8 => get_array::<u64>(map, key),
            _ => Ok(None),
        },
        Map::HashMap(_) => match (key_size, value_size) {
            (4, 1) => get_hash::<u8>(map, key),
            (4, 2) => get_hash::<u16>(map, key),
            (4, 4) => get_hash::<u32>(map, key),
            (4, 8) => get_hash::<u64>(map, key),
            _ => Ok(None),
        },
        _ => Ok(None),
    };

    match read {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(Error::MapLookupFailed {
            map: map_name.to_string(),
            reason: format!("unsupported map shape (key {key_size}B, value {value_size}B)"),
        }),
        Err(e) => Err(Error::MapLookupFailed {
            map: map_name.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn get_array<V: Pod + Into<u64>>(map: &mut Map, index: u32) -> Result<Option<u64>, MapError> {
    let array: Array<_, V> = Array::try_from(&*map)?;
    Ok(Some(array.get(&index, 0)?.into()))
}

fn get_hash<V: Pod + Into<u64>>(map: &mut Map, key: u32) -> Result<Option<u64>, MapError> {
    let hash: AyaHashMap<_, u32, V> = AyaHashMap::try_from(&*map)?;
    Ok(Some(hash.get(&key, 0)?.into()))
}

/// Ring of samples taken from one monitor-map cell, reduced per aggregator.
#[derive(Debug)]
pub struct MetricsBpfMap {
    pub map_name: String,
    pub key: u32,
    pub aggregator: String,
    samples: VecDeque<u64>,
    capacity: usize,
}

impl MetricsBpfMap {
    pub fn new(spec: &MonitorMapSpec, capacity: usize) -> Self {
        Self {
            map_name: spec.name.clone(),
            key: spec.key,
            aggregator: spec.aggregator.clone(),
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Identifier used as the per-program registry key.
    pub fn ring_key(&self) -> String {
        format!("{}{}{}", self.map_name, self.key, self.aggregator)
    }

    /// Metric name published for this cell.
    pub fn metric_name(&self) -> String {
        format!("{}_{}_{}", self.map_name, self.key, self.aggregator)
    }

    pub fn record(&mut self, sample: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Reduce the ring per the declared aggregator:
    /// `max-rate` is the largest increase between consecutive samples,
    /// `avg` the mean, anything else the most recent sample.
    pub fn value(&self) -> f64 {
        match self.aggregator.as_str() {
            "max-rate" => self
                .samples
                .iter()
                .zip(self.samples.iter().skip(1))
                .map(|(prev, next)| next.saturating_sub(*prev))
                .max()
                .unwrap_or(0) as f64,
            "avg" => {
                if self.samples.is_empty() {
                    0.0
                } else {
                    self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
                }
            }
            _ => self.samples.back().copied().unwrap_or(0) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(aggregator: &str, capacity: usize) -> MetricsBpfMap {
        MetricsBpfMap::new(
            &MonitorMapSpec {
                name: "cl_drop_count_map".into(),
                key: 0,
                aggregator: aggregator.into(),
            },
            capacity,
        )
    }

    #[test]
    fn test_ring_key_and_metric_name() {
        let m = ring("max-rate", 4);
        assert_eq!(m.ring_key(), "cl_drop_count_map0max-rate");
        assert_eq!(m.metric_name(), "cl_drop_count_map_0_max-rate");
    }

    #[test]
    fn test_ring_caps_samples() {
        let mut m = ring("avg", 3);
        for v in [1, 2, 3, 4, 5] {
            m.record(v);
        }
        // only the last three survive
        assert_eq!(m.value(), 4.0);
    }

    #[test]
    fn test_max_rate_uses_consecutive_deltas() {
        let mut m = ring("max-rate", 8);
        for v in [100, 150, 150, 400, 410] {
            m.record(v);
        }
        assert_eq!(m.value(), 250.0);
    }

    #[test]
    fn test_max_rate_tolerates_counter_reset() {
        let mut m = ring("max-rate", 8);
        for v in [500, 10, 20] {
            m.record(v);
        }
        // the reset delta saturates to zero instead of underflowing
        assert_eq!(m.value(), 10.0);
    }

    #[test]
    fn test_default_aggregator_is_last_value() {
        let mut m = ring("", 4);
        assert_eq!(m.value(), 0.0);
        m.record(7);
        m.record(9);
        assert_eq!(m.value(), 9.0);
    }
}
