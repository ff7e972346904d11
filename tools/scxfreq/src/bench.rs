// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use scx_cpufreq::CpufreqSession;
use scx_cpufreq::Gateway;

#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub transitions: usize,
    pub elapsed: Duration,
}

impl BenchReport {
    /// Mean time of a single frequency transition in microseconds.
    pub fn mean_latency_us(&self) -> f64 {
        if self.transitions == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1_000_000.0 / self.transitions as f64
    }
}

/// Per round, move every CPU to a random available frequency and check that
/// the session recorded it. Stops early once `shutdown` is set.
pub fn run<G: Gateway>(
    sess: &CpufreqSession<G>,
    rounds: usize,
    rng: &mut fastrand::Rng,
    shutdown: &AtomicBool,
) -> Result<BenchReport> {
    let nr_cpus = sess.nr_cpus()?;
    let freqs = sess.available_freqs()?.to_vec();
    let mut transitions = 0;

    let started_at = Instant::now();
    for round in 0..rounds {
        if shutdown.load(Ordering::Relaxed) {
            debug!("bench interrupted after {} rounds", round);
            break;
        }
        for cpu in 0..nr_cpus {
            let freq = freqs[rng.usize(..freqs.len())];
            sess.set_freq(cpu, freq)?;
            let cur = sess.freq(cpu)?;
            if cur != freq {
                bail!("cpu{} is at {} kHz instead of {} kHz", cpu, cur, freq);
            }
            transitions += 1;
        }
    }

    Ok(BenchReport {
        transitions,
        elapsed: started_at.elapsed(),
    })
}
