// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # cpufreq control files
//!
//! Every CPU exposes its frequency scaling policy under
//! `/sys/devices/system/cpu/cpu<N>/cpufreq/`. The [`Gateway`] trait is the
//! narrow interface the session needs on top of that: read or write one small
//! text value of one CPU, and list the online CPUs. Each call opens the file,
//! performs a single read or write and closes it again. Nothing is cached.
//!
//! [`SysfsGateway`] is the real implementation. Tests and alternative hosts
//! can provide their own.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use sscanf::sscanf;

use crate::error::CpufreqError;
use crate::error::Result;

/// The cpufreq attributes a session touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attr {
    /// Declared frequency list, space separated.
    AvailableFrequencies,
    Governor,
    /// Effective frequency as reported by the driver.
    CurFreq,
    /// Requested frequency, only writable under the userspace governor.
    SetSpeed,
    MinFreq,
    MaxFreq,
}

impl Attr {
    pub fn file_name(&self) -> &'static str {
        match self {
            Attr::AvailableFrequencies => "scaling_available_frequencies",
            Attr::Governor => "scaling_governor",
            Attr::CurFreq => "scaling_cur_freq",
            Attr::SetSpeed => "scaling_setspeed",
            Attr::MinFreq => "scaling_min_freq",
            Attr::MaxFreq => "scaling_max_freq",
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Upper bound on CPU IDs accepted from a cpulist. Matches the largest
/// `CONFIG_NR_CPUS` the kernel can be built with.
pub const MAX_CPUS: usize = 8192;

pub trait Gateway: Send + Sync {
    /// IDs of the online CPUs, ascending. Queried once per session. CPU IDs
    /// need not be contiguous: a session addresses the n-th online CPU by
    /// index n.
    fn online_cpus(&self) -> Result<Vec<usize>>;

    /// Identifies the host behind this gateway. Gateways returning the same
    /// key control the same CPUs.
    fn host_key(&self) -> PathBuf;

    /// Read the raw text of `attr` for `cpu`.
    fn read_text(&self, cpu: usize, attr: Attr) -> Result<String>;

    /// Replace the value of `attr` for `cpu` with `value`.
    fn write_text(&self, cpu: usize, attr: Attr, value: &str) -> Result<()>;

    /// Read `attr` and parse it. Trims null and whitespace before parsing.
    fn read_value<T>(&self, cpu: usize, attr: Attr) -> Result<T>
    where
        T: FromStr,
        Self: Sized,
    {
        let raw = self.read_text(cpu, attr)?;
        let val = raw.trim_end_matches('\0').trim();
        val.parse::<T>()
            .map_err(|_| CpufreqError::parse(format!("cpu{cpu}/{attr}"), val))
    }

    fn write_freq(&self, cpu: usize, attr: Attr, freq: u64) -> Result<()>
    where
        Self: Sized,
    {
        self.write_text(cpu, attr, &freq.to_string())
    }
}

impl<G: Gateway + ?Sized> Gateway for Arc<G> {
    fn online_cpus(&self) -> Result<Vec<usize>> {
        (**self).online_cpus()
    }

    fn host_key(&self) -> PathBuf {
        (**self).host_key()
    }

    fn read_text(&self, cpu: usize, attr: Attr) -> Result<String> {
        (**self).read_text(cpu, attr)
    }

    fn write_text(&self, cpu: usize, attr: Attr, value: &str) -> Result<()> {
        (**self).write_text(cpu, attr, value)
    }
}

/// Gateway backed by the cpufreq sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsGateway {
    root: PathBuf,
}

impl SysfsGateway {
    /// Gateway rooted at `root`, which must look like
    /// `/sys/devices/system/cpu`: an `online` cpulist file and one
    /// `cpu<N>/cpufreq/` directory per CPU.
    pub fn new_with_path(root: impl Into<PathBuf>) -> SysfsGateway {
        SysfsGateway { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attr_path(&self, cpu: usize, attr: Attr) -> PathBuf {
        self.root
            .join(format!("cpu{cpu}"))
            .join("cpufreq")
            .join(attr.file_name())
    }
}

impl Gateway for SysfsGateway {
    fn online_cpus(&self) -> Result<Vec<usize>> {
        let path = self.root.join("online");
        let online = fs::read_to_string(&path).map_err(|e| CpufreqError::io(&path, e))?;
        let cpus = read_cpulist(&online)?;
        if cpus.is_empty() {
            return Err(CpufreqError::parse(path.display().to_string(), online));
        }
        Ok(cpus)
    }

    fn host_key(&self) -> PathBuf {
        fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone())
    }

    fn read_text(&self, cpu: usize, attr: Attr) -> Result<String> {
        let path = self.attr_path(cpu, attr);
        fs::read_to_string(&path).map_err(|e| CpufreqError::io(&path, e))
    }

    fn write_text(&self, cpu: usize, attr: Attr, value: &str) -> Result<()> {
        let path = self.attr_path(cpu, attr);
        fs::write(&path, value).map_err(|e| CpufreqError::io(&path, e))
    }
}

/// Expand a kernel cpulist such as `0-3,8,10-11` into sorted CPU IDs. IDs
/// at or above [`MAX_CPUS`] are rejected.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    return Err(CpufreqError::parse("cpulist", group.trim()));
                }
            },
        };
        if min > max || max >= MAX_CPUS {
            return Err(CpufreqError::parse("cpulist", group.trim()));
        }
        cpu_ids.extend(min..=max);
    }
    cpu_ids.sort_unstable();
    cpu_ids.dedup();

    Ok(cpu_ids)
}
