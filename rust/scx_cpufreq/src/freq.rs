// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::error::CpufreqError;
use crate::error::Result;

/// Parse a `scaling_available_frequencies` style list. Values are separated
/// by whitespace and the kernel leaves a trailing space behind the last one.
pub fn parse_freq_list(list: &str) -> Result<Vec<u64>> {
    list.trim_end_matches('\0')
        .split_whitespace()
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| CpufreqError::parse("frequency list", s))
        })
        .collect()
}

/// Strictly ascending, non-empty set of frequencies in kHz.
///
/// Positions in the table are the step indices used for increasing and
/// decreasing the frequency one notch at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreqTable {
    freqs: Vec<u64>,
}

impl FreqTable {
    /// Sort and deduplicate `freqs`. Zero is not a frequency and is dropped.
    /// Returns None if nothing is left.
    pub fn new(freqs: impl IntoIterator<Item = u64>) -> Option<FreqTable> {
        let mut freqs: Vec<u64> = freqs.into_iter().filter(|&f| f > 0).collect();
        freqs.sort_unstable();
        freqs.dedup();
        if freqs.is_empty() {
            return None;
        }
        Some(FreqTable { freqs })
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.freqs
    }

    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    pub fn min(&self) -> u64 {
        self.freqs[0]
    }

    pub fn max(&self) -> u64 {
        self.freqs[self.freqs.len() - 1]
    }

    pub fn get(&self, idx: usize) -> Option<u64> {
        self.freqs.get(idx).copied()
    }

    /// Exact lookup of the step index of `freq`.
    pub fn index_of(&self, freq: u64) -> Option<usize> {
        self.freqs.binary_search(&freq).ok()
    }

    pub fn contains(&self, freq: u64) -> bool {
        self.index_of(freq).is_some()
    }

    /// Least frequency >= `freq`, or the maximum if `freq` is above it.
    pub fn ceil(&self, freq: u64) -> u64 {
        let idx = self.freqs.partition_point(|&f| f < freq);
        self.get(idx).unwrap_or_else(|| self.max())
    }

    /// Greatest frequency <= `freq`, or the minimum if `freq` is below it.
    pub fn floor(&self, freq: u64) -> u64 {
        match self.freqs.partition_point(|&f| f <= freq) {
            0 => self.min(),
            idx => self.freqs[idx - 1],
        }
    }
}
