// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # cpufreq pinning session
//!
//! A [`CpufreqSession`] takes frequency selection away from the kernel
//! governor and hands it to the caller, one CPU at a time.
//!
//! Creating a session runs discovery:
//!
//! 1. List the online CPUs.
//! 2. Read the declared frequencies of the first online CPU, sort and
//!    deduplicate them.
//! 3. Snapshot that CPU's governor and its current, minimum and maximum
//!    frequency. Nothing has been written yet at this point.
//! 4. Widen every CPU's scaling range to the declared bounds, then switch
//!    every CPU to the userspace governor.
//! 5. Probe. Each declared frequency is requested on the first online CPU
//!    and read back.
//!    Only frequencies the driver actually settles on are kept, as some
//!    drivers advertise steps they silently merge into a neighbour.
//! 6. Pin every CPU to the lowest surviving frequency.
//!
//! If any step fails, whatever was already written is rolled back and a
//! [`CpufreqError::Discovery`] is returned.
//!
//! Closing the session writes the snapshot back to every CPU in the order
//! current frequency, minimum, maximum, governor. The current frequency goes
//! first because the range is still wide at that point and the driver will
//! not reject it.
//!
//! CPUs are addressed by index, `0..nr_cpus`. Index n is the n-th online CPU,
//! which is CPU n itself unless some CPU in between is offline.
//!
//! Only one session per host can be active in a process. Creating a second
//! one fails with [`CpufreqError::HostBusy`] until the first is closed or
//! dropped.
//!
//! Frequencies reported by [`CpufreqSession::freq`] are what the session last
//! wrote, not what the hardware is running at. Nothing else is expected to
//! touch the cpufreq files while a session is active. Use
//! [`CpufreqSession::read_hw_freq`] for a fresh reading.
//!
//! Writes to the same CPU are serialized. Writes to different CPUs are
//! independent and may be issued from different threads.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;

use log::debug;
use log::info;
use log::warn;

use crate::config::Config;
use crate::error::CpufreqError;
use crate::error::Result;
use crate::freq::parse_freq_list;
use crate::freq::FreqTable;
use crate::sysfs::Attr;
use crate::sysfs::Gateway;
use crate::sysfs::SysfsGateway;

/// Index of the CPU whose policy is read for discovery and used for
/// probing.
pub const REPR_CPU: usize = 0;

lazy_static::lazy_static! {
    static ref CLAIMED_HOSTS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// Marks a host as controlled by an active session. Released on drop.
#[derive(Debug)]
struct HostClaim {
    host: PathBuf,
}

impl HostClaim {
    fn acquire(host: PathBuf) -> Result<HostClaim> {
        let mut claimed = CLAIMED_HOSTS.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(host.clone()) {
            return Err(CpufreqError::HostBusy { host });
        }
        Ok(HostClaim { host })
    }
}

impl Drop for HostClaim {
    fn drop(&mut self) {
        CLAIMED_HOSTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.host);
    }
}

/// Host policy as found before the session touched anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub governor: String,
    pub cur_freq: u64,
    pub min_freq: u64,
    pub max_freq: u64,
}

impl Snapshot {
    fn capture<G: Gateway>(gateway: &G, cpu: usize) -> Result<Snapshot> {
        Ok(Snapshot {
            governor: gateway.read_value(cpu, Attr::Governor)?,
            cur_freq: gateway.read_value(cpu, Attr::CurFreq)?,
            min_freq: gateway.read_value(cpu, Attr::MinFreq)?,
            max_freq: gateway.read_value(cpu, Attr::MaxFreq)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Closed,
}

// Invariant: freqs[idx] == freq.
#[derive(Debug, Clone, Copy)]
struct CpuState {
    freq: u64,
    idx: usize,
}

pub struct CpufreqSession<G: Gateway = SysfsGateway> {
    gateway: G,
    // cpu_ids[idx] is the host's ID for CPU index idx.
    cpu_ids: Vec<usize>,
    governor: String,
    freqs: FreqTable,
    snapshot: Snapshot,
    cpus: Vec<Mutex<CpuState>>,
    lifecycle: RwLock<Lifecycle>,
    claim: Mutex<Option<HostClaim>>,
}

impl<G: Gateway> CpufreqSession<G> {
    /// Take control of every CPU's frequency. See the module documentation
    /// for the discovery steps.
    ///
    /// Fails with [`CpufreqError::HostBusy`], without touching the host, if
    /// another session of this process is active on it.
    pub fn new(gateway: G, config: &Config) -> Result<CpufreqSession<G>> {
        let claim = HostClaim::acquire(gateway.host_key())?;
        Self::discover(gateway, config, claim).map_err(|e| CpufreqError::Discovery(Box::new(e)))
    }

    fn discover(gateway: G, config: &Config, claim: HostClaim) -> Result<CpufreqSession<G>> {
        let cpu_ids = gateway.online_cpus()?;
        let repr = *cpu_ids
            .get(REPR_CPU)
            .ok_or_else(|| CpufreqError::parse("online CPUs", ""))?;
        let raw = gateway.read_text(repr, Attr::AvailableFrequencies)?;
        let declared = FreqTable::new(parse_freq_list(&raw)?)
            .ok_or(CpufreqError::NoFrequencies { declared: vec![] })?;
        let snapshot = Snapshot::capture(&gateway, repr)?;

        debug!(
            "cpufreq: CPUs {:?}, declared {:?}, found {:?}",
            cpu_ids,
            declared.as_slice(),
            snapshot
        );

        let freqs = match take_control(&gateway, &cpu_ids, repr, &declared, config) {
            Ok(freqs) => freqs,
            Err(e) => {
                warn!("cpufreq discovery failed ({}), rolling back", e);
                if let Err(re) = restore_host(&gateway, &cpu_ids, &config.governor, &snapshot) {
                    warn!("cpufreq rollback incomplete: {}", re);
                }
                return Err(e);
            }
        };

        let min = CpuState {
            freq: freqs.min(),
            idx: 0,
        };
        info!(
            "cpufreq session active: {} CPUs pinned to {} kHz, {} usable frequencies ({}-{} kHz)",
            cpu_ids.len(),
            freqs.min(),
            freqs.len(),
            freqs.min(),
            freqs.max()
        );

        Ok(CpufreqSession {
            gateway,
            cpus: cpu_ids.iter().map(|_| Mutex::new(min)).collect(),
            cpu_ids,
            governor: config.governor.clone(),
            freqs,
            snapshot,
            lifecycle: RwLock::new(Lifecycle::Active),
            claim: Mutex::new(Some(claim)),
        })
    }

    /// Is the session still in control of the host?
    pub fn is_active(&self) -> bool {
        *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner) == Lifecycle::Active
    }

    /// Host policy captured at construction and restored on close.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn nr_cpus(&self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.cpu_ids.len())
    }

    /// Host CPU IDs by index.
    pub fn cpu_ids(&self) -> Result<&[usize]> {
        self.ensure_active()?;
        Ok(&self.cpu_ids)
    }

    /// Frequencies that survived probing, ascending.
    pub fn available_freqs(&self) -> Result<&[u64]> {
        self.ensure_active()?;
        Ok(self.freqs.as_slice())
    }

    pub fn min_freq(&self) -> Result<u64> {
        self.ensure_active()?;
        Ok(self.freqs.min())
    }

    pub fn max_freq(&self) -> Result<u64> {
        self.ensure_active()?;
        Ok(self.freqs.max())
    }

    /// Last frequency the session set on `cpu`. This is not read back from
    /// the hardware.
    pub fn freq(&self, cpu: usize) -> Result<u64> {
        self.with_cpu(cpu, |state| Ok(state.freq))
    }

    /// Position of `cpu`'s frequency in [`Self::available_freqs`].
    pub fn step_index(&self, cpu: usize) -> Result<usize> {
        self.with_cpu(cpu, |state| Ok(state.idx))
    }

    /// Effective frequency of `cpu` as currently reported by the driver.
    pub fn read_hw_freq(&self, cpu: usize) -> Result<u64> {
        self.with_cpu(cpu, |_| {
            self.gateway.read_value(self.cpu_ids[cpu], Attr::CurFreq)
        })
    }

    /// Pin `cpu` to `freq`, which must be one of the available frequencies.
    pub fn set_freq(&self, cpu: usize, freq: u64) -> Result<()> {
        self.with_cpu(cpu, |state| self.transition(cpu, state, freq))
    }

    /// Pin every CPU to `freq`, in CPU order. Stops at the first failing CPU.
    pub fn set_freq_all(&self, freq: u64) -> Result<()> {
        self.ensure_active()?;
        if !self.freqs.contains(freq) {
            return Err(CpufreqError::InvalidFrequency { freq });
        }
        self.for_each_cpu(|cpu, state| self.transition(cpu, state, freq))
    }

    pub fn set_min_freq(&self, cpu: usize) -> Result<()> {
        self.set_freq(cpu, self.freqs.min())
    }

    pub fn set_min_freq_all(&self) -> Result<()> {
        self.set_freq_all(self.freqs.min())
    }

    pub fn set_max_freq(&self, cpu: usize) -> Result<()> {
        self.set_freq(cpu, self.freqs.max())
    }

    pub fn set_max_freq_all(&self) -> Result<()> {
        self.set_freq_all(self.freqs.max())
    }

    /// Move `cpu` one step up. Does nothing if it is already at the top.
    pub fn increase_freq(&self, cpu: usize) -> Result<()> {
        self.with_cpu(cpu, |state| self.step(cpu, state, true))
    }

    pub fn increase_freq_all(&self) -> Result<()> {
        self.for_each_cpu(|cpu, state| self.step(cpu, state, true))
    }

    /// Move `cpu` one step down. Does nothing if it is already at the bottom.
    pub fn decrease_freq(&self, cpu: usize) -> Result<()> {
        self.with_cpu(cpu, |state| self.step(cpu, state, false))
    }

    pub fn decrease_freq_all(&self) -> Result<()> {
        self.for_each_cpu(|cpu, state| self.step(cpu, state, false))
    }

    /// Pin `cpu` to the lowest frequency >= `freq`, or to the maximum.
    pub fn set_freq_geq(&self, cpu: usize, freq: u64) -> Result<()> {
        self.set_freq(cpu, self.freqs.ceil(freq))
    }

    pub fn set_freq_geq_all(&self, freq: u64) -> Result<()> {
        self.set_freq_all(self.freqs.ceil(freq))
    }

    /// Pin `cpu` to the highest frequency <= `freq`, or to the minimum.
    pub fn set_freq_leq(&self, cpu: usize, freq: u64) -> Result<()> {
        self.set_freq(cpu, self.freqs.floor(freq))
    }

    pub fn set_freq_leq_all(&self, freq: u64) -> Result<()> {
        self.set_freq_all(self.freqs.floor(freq))
    }

    /// Give the host its policy back and end the session.
    ///
    /// On failure the session stays active so that close can be attempted
    /// again.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Closed {
            return Err(CpufreqError::AlreadyClosed);
        }

        restore_host(&self.gateway, &self.cpu_ids, &self.governor, &self.snapshot)?;
        *lifecycle = Lifecycle::Closed;
        self.claim
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(
            "cpufreq session closed, governor {} restored on {} CPUs",
            self.snapshot.governor,
            self.cpu_ids.len()
        );
        Ok(())
    }

    fn active(&self) -> Result<RwLockReadGuard<'_, Lifecycle>> {
        let lifecycle = self.lifecycle.read().unwrap_or_else(PoisonError::into_inner);
        let state = *lifecycle;
        match state {
            Lifecycle::Active => Ok(lifecycle),
            Lifecycle::Closed => Err(CpufreqError::UseAfterClose),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        self.active().map(|_| ())
    }

    fn lock_cpu(&self, cpu: usize) -> Result<MutexGuard<'_, CpuState>> {
        let state = self.cpus.get(cpu).ok_or(CpufreqError::InvalidCpu {
            cpu,
            nr_cpus: self.cpu_ids.len(),
        })?;
        Ok(state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn with_cpu<T>(&self, cpu: usize, op: impl FnOnce(&mut CpuState) -> Result<T>) -> Result<T> {
        let _active = self.active()?;
        let mut state = self.lock_cpu(cpu)?;
        op(&mut *state)
    }

    fn for_each_cpu(&self, mut op: impl FnMut(usize, &mut CpuState) -> Result<()>) -> Result<()> {
        let _active = self.active()?;
        let mut completed = Vec::with_capacity(self.cpus.len());
        for cpu in 0..self.cpus.len() {
            let mut state = self.lock_cpu(cpu)?;
            if let Err(e) = op(cpu, &mut *state) {
                return Err(CpufreqError::PartialTransition {
                    completed,
                    failed_cpu: cpu,
                    source: Box::new(e),
                });
            }
            completed.push(cpu);
        }
        Ok(())
    }

    fn transition(&self, cpu: usize, state: &mut CpuState, freq: u64) -> Result<()> {
        let idx = self
            .freqs
            .index_of(freq)
            .ok_or(CpufreqError::InvalidFrequency { freq })?;
        let id = self.cpu_ids[cpu];
        self.gateway.write_freq(id, Attr::SetSpeed, freq)?;
        debug!("cpu{}: {} -> {} kHz", id, state.freq, freq);
        *state = CpuState { freq, idx };
        Ok(())
    }

    fn step(&self, cpu: usize, state: &mut CpuState, up: bool) -> Result<()> {
        let next = if up {
            state.idx.checked_add(1)
        } else {
            state.idx.checked_sub(1)
        };
        match next.and_then(|idx| self.freqs.get(idx)) {
            Some(freq) => self.transition(cpu, state, freq),
            None => Ok(()),
        }
    }
}

impl<G: Gateway> Drop for CpufreqSession<G> {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Closed {
            return;
        }

        warn!("cpufreq session dropped without close, restoring host policy");
        if let Err(e) = restore_host(&self.gateway, &self.cpu_ids, &self.governor, &self.snapshot)
        {
            warn!("failed to restore cpufreq policy: {}", e);
        }
        *lifecycle = Lifecycle::Closed;
    }
}

impl<G: Gateway> fmt::Debug for CpufreqSession<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpufreqSession")
            .field("cpu_ids", &self.cpu_ids)
            .field("freqs", &self.freqs.as_slice())
            .field("snapshot", &self.snapshot)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Discovery steps 4 to 6. Returns the probed frequency table.
fn take_control<G: Gateway>(
    gateway: &G,
    cpu_ids: &[usize],
    repr: usize,
    declared: &FreqTable,
    config: &Config,
) -> Result<FreqTable> {
    for &cpu in cpu_ids {
        gateway.write_freq(cpu, Attr::MinFreq, declared.min())?;
    }
    for &cpu in cpu_ids {
        gateway.write_freq(cpu, Attr::MaxFreq, declared.max())?;
    }
    for &cpu in cpu_ids {
        gateway.write_text(cpu, Attr::Governor, &config.governor)?;
    }

    let freqs = if config.probe {
        probe(gateway, repr, declared)?
    } else {
        declared.clone()
    };

    for &cpu in cpu_ids {
        gateway.write_freq(cpu, Attr::SetSpeed, freqs.min())?;
    }
    Ok(freqs)
}

fn probe<G: Gateway>(gateway: &G, cpu: usize, declared: &FreqTable) -> Result<FreqTable> {
    let mut honored = Vec::with_capacity(declared.len());
    for &freq in declared.as_slice() {
        gateway.write_freq(cpu, Attr::SetSpeed, freq)?;
        let effective: u64 = gateway.read_value(cpu, Attr::CurFreq)?;
        if effective == freq {
            honored.push(freq);
        } else {
            warn!(
                "cpufreq: declared {} kHz settles at {} kHz, dropping it",
                freq, effective
            );
        }
    }

    FreqTable::new(honored).ok_or_else(|| CpufreqError::NoFrequencies {
        declared: declared.as_slice().to_vec(),
    })
}

/// Write `snapshot` back to every CPU. Every write is attempted even if an
/// earlier one failed; the first error is returned. `governor` is the one the
/// session installed.
fn restore_host<G: Gateway>(
    gateway: &G,
    cpu_ids: &[usize],
    governor: &str,
    snapshot: &Snapshot,
) -> Result<()> {
    let steps = [
        (Attr::SetSpeed, snapshot.cur_freq.to_string()),
        (Attr::MinFreq, snapshot.min_freq.to_string()),
        (Attr::MaxFreq, snapshot.max_freq.to_string()),
        (Attr::Governor, snapshot.governor.clone()),
    ];

    let mut first_err = None;
    for (attr, value) in steps.iter() {
        for &cpu in cpu_ids {
            // scaling_setspeed only takes writes under the session's
            // governor. Skip CPUs not (or no longer) running it.
            if *attr == Attr::SetSpeed {
                match gateway.read_value::<String>(cpu, Attr::Governor) {
                    Ok(current) if current != governor => continue,
                    _ => {}
                }
            }
            if let Err(e) = gateway.write_text(cpu, *attr, value) {
                warn!("failed to restore {} of cpu{} to {}: {}", attr, cpu, value, e);
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
