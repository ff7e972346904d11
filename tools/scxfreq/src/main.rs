// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod bench;
mod cli;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, Direction, Rounding};
use log::{error, info};
use scx_cpufreq::init_config;
use scx_cpufreq::init_session;
use scx_cpufreq::CpufreqSession;

fn cmd_info(sess: &CpufreqSession) -> Result<()> {
    let snapshot = sess.snapshot();
    let freqs: Vec<String> = sess
        .available_freqs()?
        .iter()
        .map(|f| f.to_string())
        .collect();

    let cpu_ids: Vec<String> = sess.cpu_ids()?.iter().map(|id| id.to_string()).collect();
    println!("cpus:        {} ({})", sess.nr_cpus()?, cpu_ids.join(" "));
    println!("frequencies: {} kHz", freqs.join(" "));
    println!("governor:    {}", snapshot.governor);
    println!(
        "policy:      {} kHz in [{}, {}] kHz",
        snapshot.cur_freq, snapshot.min_freq, snapshot.max_freq
    );
    Ok(())
}

fn cmd_set(
    sess: &CpufreqSession,
    cpu: Option<usize>,
    round: Rounding,
    freq: u64,
    shutdown: &AtomicBool,
) -> Result<()> {
    match (cpu, round) {
        (Some(cpu), Rounding::Exact) => sess.set_freq(cpu, freq)?,
        (Some(cpu), Rounding::Geq) => sess.set_freq_geq(cpu, freq)?,
        (Some(cpu), Rounding::Leq) => sess.set_freq_leq(cpu, freq)?,
        (None, Rounding::Exact) => sess.set_freq_all(freq)?,
        (None, Rounding::Geq) => sess.set_freq_geq_all(freq)?,
        (None, Rounding::Leq) => sess.set_freq_leq_all(freq)?,
    }
    report_pins(sess, cpu)?;
    hold(shutdown);
    Ok(())
}

fn cmd_step(
    sess: &CpufreqSession,
    cpu: Option<usize>,
    steps: usize,
    direction: Direction,
    shutdown: &AtomicBool,
) -> Result<()> {
    if direction == Direction::Down {
        match cpu {
            Some(cpu) => sess.set_max_freq(cpu)?,
            None => sess.set_max_freq_all()?,
        }
    }
    for _ in 0..steps {
        match (cpu, direction) {
            (Some(cpu), Direction::Up) => sess.increase_freq(cpu)?,
            (Some(cpu), Direction::Down) => sess.decrease_freq(cpu)?,
            (None, Direction::Up) => sess.increase_freq_all()?,
            (None, Direction::Down) => sess.decrease_freq_all()?,
        }
    }
    report_pins(sess, cpu)?;
    hold(shutdown);
    Ok(())
}

fn cmd_bench(
    sess: &CpufreqSession,
    transitions: usize,
    seed: Option<u64>,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut rng = match seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    let report = bench::run(sess, transitions, &mut rng, shutdown)?;
    println!(
        "Mean frequency transition latency is {:.3} us (over {} transitions)",
        report.mean_latency_us(),
        report.transitions
    );
    Ok(())
}

fn report_pins(sess: &CpufreqSession, cpu: Option<usize>) -> Result<()> {
    let cpus = match cpu {
        Some(cpu) => cpu..cpu + 1,
        None => 0..sess.nr_cpus()?,
    };
    for cpu in cpus {
        let pinned = sess.freq(cpu)?;
        let hw = sess.read_hw_freq(cpu)?;
        println!(
            "cpu{}: pinned {} kHz, driver reports {} kHz",
            sess.cpu_ids()?[cpu],
            pinned,
            hw
        );
    }
    Ok(())
}

fn hold(shutdown: &AtomicBool) {
    info!("Holding frequencies, press Ctrl-C to restore the original policy");
    while !shutdown.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(100));
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loglevel = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut config = init_config(cli.config.as_deref()).context("Failed to load config")?;
    if cli.no_probe {
        config.probe = false;
    }

    let sess = init_session(config)
        .context("Failed to take over cpufreq, is the userspace governor available?")?;

    let res = match cli.command {
        Commands::Info => cmd_info(&sess),
        Commands::Set { cpu, round, freq } => cmd_set(&sess, cpu, round, freq, &shutdown),
        Commands::Step {
            cpu,
            steps,
            direction,
        } => cmd_step(&sess, cpu, steps, direction, &shutdown),
        Commands::Bench { transitions, seed } => cmd_bench(&sess, transitions, seed, &shutdown),
    };

    if let Err(e) = sess.close() {
        error!("Failed to restore the original cpufreq policy: {}", e);
        if res.is_ok() {
            return Err(e).context("Failed to close cpufreq session");
        }
    }
    res
}
