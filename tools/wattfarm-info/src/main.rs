// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Prints the machine as wattfarm sees it: the topology tree, the
//! frequency domains with their governors, and the energy counters. With
//! `--watch`, keeps sampling the preferred counter and prints power draw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;

use wattfarm::{CpuFreq, Energy, Topology};

#[derive(Debug, Parser)]
#[command(
    name = "wattfarm-info",
    about = "Inspect the topology, frequency and energy facilities of this machine"
)]
struct Opts {
    /// Print the topology tree.
    #[arg(long)]
    topology: bool,

    /// Print the frequency domains.
    #[arg(long)]
    frequency: bool,

    /// Print the energy counters and power caps.
    #[arg(long)]
    energy: bool,

    /// Keep sampling the preferred energy counter at this interval, in
    /// seconds, and print watts until interrupted.
    #[arg(long)]
    watch: Option<f64>,
}

fn print_topology(topology: &Topology) {
    println!("topology: {} cpu(s)", topology.cpus().len());
    for cpu in topology.cpus() {
        println!(
            "  cpu {} (vendor {})",
            cpu.id(),
            cpu.vendor_id().unwrap_or_else(|_| "?".into())
        );
        for core in cpu.physical_cores() {
            let vcs: Vec<String> = core
                .virtual_cores()
                .iter()
                .map(|vc| {
                    let plugged = match vc.is_hot_plugged() {
                        Ok(true) => "",
                        Ok(false) => " (offline)",
                        Err(_) => " (?)",
                    };
                    format!("{}{}", vc.id(), plugged)
                })
                .collect();
            println!("    core {}: vcs [{}]", core.id(), vcs.join(", "));
        }
    }
    if let Ok(vc) = topology.virtual_core(0) {
        if !vc.idle_levels().is_empty() {
            println!("  idle levels of vc 0:");
        }
        for level in vc.idle_levels() {
            println!(
                "    {}: {} (exit {} us, {} entries)",
                level.name(),
                level.desc(),
                level.exit_latency_us().unwrap_or(0),
                level.absolute_count().unwrap_or(0)
            );
        }
    }
}

fn print_frequency(cpufreq: &CpuFreq) {
    println!("frequency: {} domain(s)", cpufreq.domains().len());
    match cpufreq.is_boosting_supported() {
        Ok(true) => println!(
            "  boosting: {}",
            match cpufreq.is_boosting_enabled() {
                Ok(true) => "enabled",
                Ok(false) => "disabled",
                Err(_) => "unknown",
            }
        ),
        _ => println!("  boosting: unsupported"),
    }
    for domain in cpufreq.domains() {
        println!("  domain {}: vcs {:?}", domain.id(), domain.virtual_core_ids());
        if let Ok(freqs) = domain.available_frequencies() {
            let khz: Vec<String> = freqs.iter().map(|f| f.to_string()).collect();
            println!("    frequencies (kHz): {}", khz.join(" "));
        }
        if let Ok(governors) = domain.available_governors() {
            let names: Vec<&str> = governors.iter().map(|g| g.name()).collect();
            println!("    governors: {}", names.join(" "));
        }
        if let Ok(g) = domain.current_governor() {
            println!("    current governor: {}", g);
        }
        if let Ok(f) = domain.current_frequency() {
            println!("    current frequency: {} kHz", f);
        }
        if let Ok((lb, ub)) = domain.hardware_frequency_bounds() {
            println!("    hardware bounds: [{}, {}] kHz", lb, ub);
        }
        if let Ok(lat) = domain.transition_latency_ns() {
            println!("    transition latency: {} ns", lat);
        }
    }
}

fn print_energy(energy: &Energy) {
    let types = energy.counter_types();
    if types.is_empty() {
        println!("energy: no counters available");
        return;
    }
    println!("energy: counters {:?}", types);
    if let Some(counter) = energy.counter_cpus() {
        println!(
            "  per-cpu counters on cpus {:?} (cores: {}, graphic: {}, dram: {})",
            counter.cpu_ids(),
            counter.has_cores(),
            counter.has_graphic(),
            counter.has_dram()
        );
        for cpu in counter.cpu_ids() {
            match counter.read_components(cpu) {
                Ok(joules) => println!("    cpu {}: {}", cpu, joules),
                Err(e) => warn!("cannot read cpu {}: {}", cpu, e),
            }
        }
    }
    if let Ok(capper) = energy.power_capper() {
        for socket in 0..capper.sockets() as u32 {
            for window in 0..2 {
                if let Ok(cap) = capper.get(socket, window) {
                    println!(
                        "  cap socket {} window {}: {:.1} W over {:.3} s",
                        socket, window, cap.watts, cap.window_secs
                    );
                }
            }
        }
    }
}

fn watch(energy: &Energy, interval: Duration) -> Result<()> {
    let counter = energy
        .preferred_counter()
        .context("no energy counter to watch")?;
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Relaxed))
        .context("cannot install the signal handler")?;

    counter.reset().context("cannot reset the counter")?;
    let mut last = Instant::now();
    let mut last_joules = 0.0;
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        let joules = counter.joules().context("cannot read the counter")?;
        let now = Instant::now();
        let watts = (joules - last_joules) / now.duration_since(last).as_secs_f64();
        println!("{:.2} W ({:?} counter)", watts, counter.counter_type());
        last = now;
        last_joules = joules;
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    // No section flags means all sections.
    let all = !opts.topology && !opts.frequency && !opts.energy && opts.watch.is_none();

    let topology = Topology::new().context("cannot enumerate the topology")?;
    if opts.topology || all {
        print_topology(&topology);
    }

    if opts.frequency || all {
        match CpuFreq::new() {
            Ok(cpufreq) => print_frequency(&cpufreq),
            Err(e) => warn!("frequency scaling unavailable: {}", e),
        }
    }

    if opts.energy || all || opts.watch.is_some() {
        match Energy::new() {
            Ok(energy) => {
                if opts.energy || all {
                    print_energy(&energy);
                }
                if let Some(secs) = opts.watch {
                    watch(&energy, Duration::from_secs_f64(secs))?;
                }
            }
            Err(e) => warn!("energy counters unavailable: {}", e),
        }
    }

    Ok(())
}
