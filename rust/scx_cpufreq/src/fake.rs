// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-memory cpufreq host for tests. It behaves like acpi-cpufreq under the
//! userspace governor: `scaling_setspeed` is only writable in userspace
//! mode, requests are clamped to the scaling range and can be redirected to
//! emulate drivers that merge neighbouring steps.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::config::USERSPACE_GOVERNOR;
use crate::error::CpufreqError;
use crate::error::Result;
use crate::sysfs::Attr;
use crate::sysfs::Gateway;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeCpu {
    pub governor: String,
    pub cur: u64,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Default)]
struct HostState {
    declared: String,
    cpus: Vec<FakeCpu>,
    offline: HashSet<usize>,
    coalesce: BTreeMap<u64, u64>,
    failing: HashSet<(usize, Attr)>,
    writes: Vec<(usize, Attr, String)>,
}

#[derive(Debug)]
pub(crate) struct FakeHost {
    id: usize,
    state: Mutex<HostState>,
}

static NEXT_HOST_ID: AtomicUsize = AtomicUsize::new(0);

impl FakeHost {
    /// Host running schedutil at 1.6GHz within [1.4GHz, 1.8GHz]. `freqs` are
    /// declared highest first like most drivers do.
    pub fn new(nr_cpus: usize, freqs: &[u64]) -> Arc<FakeHost> {
        let declared: Vec<String> = freqs.iter().rev().map(|f| f.to_string()).collect();
        let cpu = FakeCpu {
            governor: "schedutil".to_string(),
            cur: 1600000,
            min: 1400000,
            max: 1800000,
        };
        Arc::new(FakeHost {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(HostState {
                declared: declared.join(" ") + " \n",
                cpus: vec![cpu; nr_cpus],
                ..Default::default()
            }),
        })
    }

    /// Take `cpu` offline. Its cpufreq files disappear.
    pub fn offline(&self, cpu: usize) {
        self.state.lock().unwrap().offline.insert(cpu);
    }

    /// Requests for `requested` end up at `effective`.
    pub fn coalesce(&self, requested: u64, effective: u64) {
        self.state
            .lock()
            .unwrap()
            .coalesce
            .insert(requested, effective);
    }

    /// Make every access to `attr` of `cpu` fail.
    pub fn fail(&self, cpu: usize, attr: Attr) {
        self.state.lock().unwrap().failing.insert((cpu, attr));
    }

    pub fn unfail(&self, cpu: usize, attr: Attr) {
        self.state.lock().unwrap().failing.remove(&(cpu, attr));
    }

    pub fn cpu(&self, cpu: usize) -> FakeCpu {
        self.state.lock().unwrap().cpus[cpu].clone()
    }

    /// Successful writes in the order they happened.
    pub fn writes(&self) -> Vec<(usize, Attr, String)> {
        self.state.lock().unwrap().writes.clone()
    }
}

fn fake_err(cpu: usize, attr: Attr, kind: io::ErrorKind) -> CpufreqError {
    CpufreqError::Io {
        path: PathBuf::from(format!("fake/cpu{cpu}/cpufreq/{attr}")),
        source: io::Error::from(kind),
    }
}

impl Gateway for FakeHost {
    fn online_cpus(&self) -> Result<Vec<usize>> {
        let state = self.state.lock().unwrap();
        Ok((0..state.cpus.len())
            .filter(|cpu| !state.offline.contains(cpu))
            .collect())
    }

    fn host_key(&self) -> PathBuf {
        PathBuf::from(format!("fake/host{}", self.id))
    }

    fn read_text(&self, cpu: usize, attr: Attr) -> Result<String> {
        let state = self.state.lock().unwrap();
        if state.offline.contains(&cpu) {
            return Err(fake_err(cpu, attr, io::ErrorKind::NotFound));
        }
        if state.failing.contains(&(cpu, attr)) {
            return Err(fake_err(cpu, attr, io::ErrorKind::PermissionDenied));
        }
        let c = state
            .cpus
            .get(cpu)
            .ok_or_else(|| fake_err(cpu, attr, io::ErrorKind::NotFound))?;
        let val = match attr {
            Attr::AvailableFrequencies => return Ok(state.declared.clone()),
            Attr::Governor => c.governor.clone(),
            Attr::CurFreq => c.cur.to_string(),
            Attr::SetSpeed if c.governor == USERSPACE_GOVERNOR => c.cur.to_string(),
            Attr::SetSpeed => "<unsupported>".to_string(),
            Attr::MinFreq => c.min.to_string(),
            Attr::MaxFreq => c.max.to_string(),
        };
        Ok(val + "\n")
    }

    fn write_text(&self, cpu: usize, attr: Attr, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.offline.contains(&cpu) {
            return Err(fake_err(cpu, attr, io::ErrorKind::NotFound));
        }
        if state.failing.contains(&(cpu, attr)) {
            return Err(fake_err(cpu, attr, io::ErrorKind::PermissionDenied));
        }
        let parsed = value.trim().parse::<u64>().ok();
        let redirected = parsed.map(|f| *state.coalesce.get(&f).unwrap_or(&f));
        let c = state
            .cpus
            .get_mut(cpu)
            .ok_or_else(|| fake_err(cpu, attr, io::ErrorKind::NotFound))?;
        let freq = || parsed.ok_or_else(|| CpufreqError::parse(attr.to_string(), value));

        match attr {
            Attr::Governor => c.governor = value.trim().to_string(),
            Attr::SetSpeed => {
                if c.governor != USERSPACE_GOVERNOR {
                    return Err(fake_err(cpu, attr, io::ErrorKind::InvalidInput));
                }
                let target = redirected
                    .ok_or_else(|| CpufreqError::parse(attr.to_string(), value))?;
                c.cur = target.max(c.min).min(c.max);
            }
            Attr::MinFreq => {
                c.min = freq()?;
                c.cur = c.cur.max(c.min);
            }
            Attr::MaxFreq => {
                c.max = freq()?;
                c.cur = c.cur.min(c.max);
            }
            Attr::CurFreq | Attr::AvailableFrequencies => {
                return Err(fake_err(cpu, attr, io::ErrorKind::PermissionDenied));
            }
        }
        state.writes.push((cpu, attr, value.to_string()));
        Ok(())
    }
}
