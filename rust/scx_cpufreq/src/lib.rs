// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-CPU frequency pinning
//!
//! This crate takes over frequency selection from the kernel's cpufreq
//! governor and lets the caller pin each CPU to an exact frequency. It is
//! meant for experiments and benchmarks that need a known, stable clock, and
//! for userspace components that want to drive DVFS themselves.
//!
//! The host needs a cpufreq driver that supports the `userspace` governor
//! (e.g. acpi-cpufreq) and write access to
//! `/sys/devices/system/cpu/cpu*/cpufreq/*`. Only single package hosts where
//! every CPU offers the same frequency steps are supported.
//!
//! ```no_run
//! let sess = scx_cpufreq::session()?;
//! let max = sess.max_freq()?;
//! sess.set_freq(0, max)?;
//! sess.decrease_freq_all()?;
//! sess.close()?;
//! # Ok::<(), scx_cpufreq::CpufreqError>(())
//! ```
//!
//! A session restores the governor and scaling range it found when it is
//! closed, or as a last resort when it is dropped.

pub mod config;
pub use config::init_config;
pub use config::Config;

mod error;
pub use error::CpufreqError;
pub use error::Result;

mod freq;
pub use freq::parse_freq_list;
pub use freq::FreqTable;

mod registry;
pub use registry::init_session;
pub use registry::session;
pub use registry::SessionRegistry;

mod session;
pub use session::CpufreqSession;
pub use session::Snapshot;
pub use session::REPR_CPU;

pub mod sysfs;
pub use sysfs::Attr;
pub use sysfs::Gateway;
pub use sysfs::SysfsGateway;

#[cfg(test)]
mod fake;
