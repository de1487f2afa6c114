use std::collections::BTreeMap;

use crate::Error;

/// One processor record from `/proc/cpuinfo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuData {
    pub processor: u32,
    pub physical_id: u32,
    pub core_id: u32,
}

/// Host CPU topology with hyperthread siblings grouped together.
#[derive(Clone, Debug, Default)]
pub struct CpuInfo {
    cpu_datas: BTreeMap<u32, CpuData>,
    layout: Vec<Vec<u32>>,
}

impl CpuInfo {
    /// Parses `/proc/cpuinfo` text: records separated by blank lines, each
    /// carrying `processor`, `physical id` and `core id` fields. A
    /// duplicate `processor` value is fatal.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut cpu_datas = BTreeMap::new();
        let mut groups = BTreeMap::new();
        let mut layout: Vec<Vec<u32>> = Vec::new();
        let mut record: BTreeMap<&str, u32> = BTreeMap::new();
        for line in text.lines().chain(std::iter::once("")) {
            if !line.trim().is_empty() {
                if let Some((key, value)) = line.split_once(':') {
                    if let Ok(value) = value.trim().parse() {
                        match key.trim() {
                            key @ ("processor" | "physical id" | "core id") => {
                                record.insert(key, value);
                            }
                            _ => {}
                        }
                    }
                }
                continue;
            }
            let processor = match record.get("processor") {
                Some(v) => *v,
                None => {
                    record.clear();
                    continue;
                }
            };
            let data = CpuData {
                processor,
                physical_id: record.get("physical id").copied().unwrap_or(0),
                // Without topology fields every processor is its own core.
                core_id: record.get("core id").copied().unwrap_or(processor),
            };
            record.clear();
            if cpu_datas.insert(processor, data).is_some() {
                return Err(Error::config(format!(
                    "duplicate processor {processor} in cpuinfo"
                )));
            }
            let group = *groups
                .entry((data.physical_id, data.core_id))
                .or_insert_with(|| {
                    layout.push(Vec::new());
                    layout.len() - 1
                });
            layout[group].push(processor);
        }
        Ok(Self { cpu_datas, layout })
    }

    pub fn load() -> Result<Self, Error> {
        Self::parse(&std::fs::read_to_string("/proc/cpuinfo")?)
    }

    pub fn nb_cpus(&self) -> usize {
        self.cpu_datas.len()
    }

    pub fn get(&self, processor: u32) -> Option<&CpuData> {
        self.cpu_datas.get(&processor)
    }

    pub fn processors(&self) -> Vec<u32> {
        self.cpu_datas.keys().copied().collect()
    }

    /// Processor groups sharing `(physical_id, core_id)`: the hyperthread
    /// siblings a caller may want to keep off distinct runners.
    pub fn layout(&self) -> &[Vec<u32>] {
        &self.layout
    }
}

/// Restricts each sibling group to the processors in `cpus`, dropping
/// groups left empty. Every returned group is non-empty and contains only
/// requested processors.
pub fn partition_cpus(cpuinfo: &CpuInfo, cpus: &[u32]) -> Vec<Vec<u32>> {
    cpuinfo
        .layout()
        .iter()
        .map(|group| {
            group
                .iter()
                .copied()
                .filter(|v| cpus.contains(v))
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
}

/// The degraded layout used without `--cpuinfo`: one singleton group per
/// processor, no sibling information.
pub fn singleton_layout(cpus: &[u32]) -> Vec<Vec<u32>> {
    cpus.iter().map(|v| vec![*v]).collect()
}

/// Parses a processor list such as `1,3,2,7,8-12,15`. Ranges are inclusive;
/// duplicates collapse, first occurrence wins.
pub fn parse_cpu_list(text: &str) -> Result<Vec<u32>, Error> {
    let mut cpus = Vec::new();
    let mut push = |v: u32| {
        if !cpus.contains(&v) {
            cpus.push(v);
        }
    };
    for part in text.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(format!("invalid cpu interval: {part}")))?;
                let hi: u32 = hi
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(format!("invalid cpu interval: {part}")))?;
                if lo > hi {
                    return Err(Error::config(format!("invalid cpu interval: {part}")));
                }
                (lo..=hi).for_each(&mut push);
            }
            None => push(
                part.parse()
                    .map_err(|_| Error::config(format!("invalid cpu: {part}")))?,
            ),
        }
    }
    Ok(cpus)
}

/// Formats a processor set the way `cpuset.cpus` expects: sorted, comma
/// separated, consecutive runs collapsed to `a-b`.
pub fn format_cpu_list(cpus: &[u32]) -> String {
    let mut cpus: Vec<u32> = cpus.to_vec();
    cpus.sort_unstable();
    cpus.dedup();
    let mut parts: Vec<String> = Vec::new();
    let mut iter = cpus.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end = iter.next().unwrap();
        }
        if end > start {
            parts.push(format!("{start}-{end}"));
        } else {
            parts.push(format!("{start}"));
        }
    }
    parts.join(",")
}
