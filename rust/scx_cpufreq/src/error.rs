// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CpufreqError>;

#[derive(Debug, Error)]
pub enum CpufreqError {
    /// Session construction failed. Nothing is left active and the caller
    /// has to start over.
    #[error("cpufreq discovery failed: {0}")]
    Discovery(#[source] Box<CpufreqError>),

    #[error("no usable frequency survived probing (declared {declared:?})")]
    NoFrequencies { declared: Vec<u64> },

    #[error("frequency {freq} is not in the available set")]
    InvalidFrequency { freq: u64 },

    #[error("invalid CPU {cpu} passed, nr_cpus {nr_cpus}")]
    InvalidCpu { cpu: usize, nr_cpus: usize },

    #[error("failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {value:?} from {what}")]
    Parse { what: String, value: String },

    /// A bulk operation stopped part way. The CPUs in `completed` were
    /// transitioned, `failed_cpu` and everything after it were not.
    #[error("transition failed on CPU {failed_cpu} after {} CPU(s) completed", .completed.len())]
    PartialTransition {
        completed: Vec<usize>,
        failed_cpu: usize,
        #[source]
        source: Box<CpufreqError>,
    },

    /// Another session of this process is active on the same host. Nothing
    /// was read or written.
    #[error("cpufreq on {host:?} is already controlled by an active session")]
    HostBusy { host: PathBuf },

    #[error("cpufreq session used after close")]
    UseAfterClose,

    #[error("cpufreq session already closed")]
    AlreadyClosed,

    #[error("invalid config: {0}")]
    Config(String),
}

impl CpufreqError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CpufreqError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, value: impl Into<String>) -> Self {
        CpufreqError::Parse {
            what: what.into(),
            value: value.into(),
        }
    }

    /// Is this a failure of the session's construction?
    pub fn is_discovery(&self) -> bool {
        matches!(self, CpufreqError::Discovery(_))
    }
}
