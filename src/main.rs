// SPDX-License-Identifier: GPL-2.0

mod affinity;
mod counters;
mod stats;
mod worker;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::debug;
use log::info;
use log::warn;

use counters::CounterBlock;
use stats::RateSampler;
use stats::Summary;
use worker::WorkerHandle;

/// ctrbench: a shared-counter contention benchmark
///
/// Spawns worker threads that each perform a fixed budget of atomic
/// increments against a slot in a shared counter block, then prints the
/// aggregate wall time. Threads can be pinned to CPUs with a configurable
/// stride, and the spacing between counter slots is configurable so that
/// workers can be forced onto the same cache line or given private ones.
///
/// While workers run, the main thread polls their progress counters
/// without synchronization and prints a live throughput estimate.
#[derive(Debug, Parser)]
struct Opts {
    /// Total worker threads.
    #[clap(short = 't', long, default_value = "1")]
    threads: i64,

    /// CPUs to use. 0 selects every online CPU; a value above the online
    /// count is rejected.
    #[clap(short = 'c', long, default_value = "1")]
    cpus: i64,

    /// Affinity stride: worker i is pinned to CPU (stride * i) mod cpus.
    /// 0 leaves all workers unbound.
    #[clap(short = 'a', long, default_value = "0")]
    affinity: usize,

    /// Distance in bytes between consecutive workers' counters. 0 puts
    /// every worker on one shared counter; 64 gives each worker a private
    /// cache line. Clamped so all slots stay inside the counter block.
    #[clap(short = 'A', long, default_value = "0")]
    align: usize,

    /// Work budget per worker, in millions of increments.
    #[clap(short = 'n', long, default_value = "400")]
    cycles: u32,

    /// Milliseconds between throughput reports.
    #[clap(short = 'w', long, default_value = "500")]
    report_ms: u64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Validated run parameters, immutable once built and shared read-only with
/// every worker.
struct GlobalConfig {
    nthreads: usize,
    cpus: usize,
    m_cycles: u32,
    affinity_stride: usize,
    align_stride: usize,
    report_interval: Duration,
    io_hook: Option<worker::IoHook>,
}

impl GlobalConfig {
    fn new(opts: &Opts) -> Result<Self> {
        let nr_cpus = affinity::nr_cpus()?;
        debug!("system has {} cpus", nr_cpus);

        if opts.cpus < 0 || opts.cpus as usize > nr_cpus {
            bail!("{} cpus requested, have only {}", opts.cpus, nr_cpus);
        }
        let cpus = if opts.cpus == 0 {
            nr_cpus
        } else {
            opts.cpus as usize
        };

        let nthreads = if opts.threads < 1 {
            warn!("bad thread count {}, using 1", opts.threads);
            1
        } else {
            opts.threads as usize
        };

        Ok(Self {
            nthreads,
            cpus,
            m_cycles: opts.cycles,
            affinity_stride: opts.affinity,
            align_stride: counters::clamp_align_stride(opts.align, nthreads),
            report_interval: Duration::from_millis(opts.report_ms),
            io_hook: worker::detect_io_privilege(),
        })
    }
}

/// Owns the counter block, the worker handles and their threads, and drives
/// the run: spawn everything, poll progress until all workers go inactive,
/// then join and aggregate.
struct Harness {
    cfg: Arc<GlobalConfig>,
    handles: Vec<Arc<WorkerHandle>>,
    threads: Vec<Option<JoinHandle<(Instant, Instant)>>>,
}

impl Harness {
    fn init(cfg: GlobalConfig) -> Self {
        let cfg = Arc::new(cfg);
        let block = Arc::new(CounterBlock::new());
        let mut handles = Vec::with_capacity(cfg.nthreads);
        let mut threads = Vec::with_capacity(cfg.nthreads);

        info!("start {} threads on {} cpus", cfg.nthreads, cfg.cpus);
        for i in 0..cfg.nthreads {
            let cpu = affinity::target_cpu(i, cfg.affinity_stride, cfg.cpus);
            let slot = counters::slot_index(i, cfg.align_stride);
            let handle = Arc::new(WorkerHandle::new(i, cpu));
            debug!("worker {} slot {} cpu {:?}", i, slot, cpu);

            let spawned = {
                let handle = handle.clone();
                let block = block.clone();
                let cfg = cfg.clone();
                std::thread::Builder::new()
                    .name(format!("ctrbench-{}", i))
                    .spawn(move || worker::run(&handle, &block, slot, cfg.m_cycles, cfg.io_hook))
            };
            let thread = match spawned {
                Ok(t) => Some(t),
                Err(e) => {
                    // This worker never ran; the rest of the run proceeds.
                    warn!("unable to create worker {}: {}", i, e);
                    handle.cancel();
                    None
                }
            };

            handles.push(handle);
            threads.push(thread);
        }

        Self {
            cfg,
            handles,
            threads,
        }
    }

    /// Install the Ctrl-C handler. The first interrupt cancels every active
    /// worker; a second one terminates immediately, like the default signal
    /// disposition would.
    fn install_sigint(&self) -> Result<()> {
        let handles = self.handles.clone();
        let seen = AtomicBool::new(false);
        ctrlc::set_handler(move || {
            if seen.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            for handle in handles.iter() {
                if handle.is_active() {
                    info!("cancelling worker {}", handle.index);
                    handle.cancel();
                }
            }
        })
        .context("Error setting Ctrl-C handler")
    }

    /// Poll worker progress on the report interval and print a throughput
    /// line per accepted tick, until every worker has gone inactive. The
    /// totals are fuzzy reads; no worker is ever blocked by monitoring.
    fn monitor(&self) {
        let mut sampler = RateSampler::new(Instant::now());
        loop {
            std::thread::sleep(self.cfg.report_interval);

            let total: u64 = self.handles.iter().map(|h| h.progress()).sum();
            let inactive = self.handles.iter().filter(|h| !h.is_active()).count();

            if let Some(rate) = sampler.sample(Instant::now(), total) {
                info!("{} Mctr/s", (rate / 1e6).round() as u64);
            }
            if inactive == self.handles.len() {
                break;
            }
        }
    }

    /// Join every worker in index order and fold completed ones into the
    /// run summary. Cancelled workers are joined too but contribute nothing.
    fn drain(&mut self) -> Summary {
        let mut summary = Summary::default();
        for (i, slot) in self.threads.iter_mut().enumerate() {
            let Some(thread) = slot.take() else {
                continue;
            };
            match thread.join() {
                Ok((tic, toc)) => {
                    let handle = &self.handles[i];
                    if handle.is_completed() {
                        summary.record(handle.progress(), tic, toc);
                    }
                }
                Err(_) => warn!("worker {} panicked", i),
            }
        }
        summary
    }
}

fn init_logger(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose)?;

    let cfg = GlobalConfig::new(&opts)?;
    let mut harness = Harness::init(cfg);
    harness.install_sigint()?;

    harness.monitor();
    let summary = harness.drain();

    info!(
        "total {} ctr across {} workers in {:.6} seconds",
        summary.total,
        summary.completed,
        summary.elapsed().as_secs_f64()
    );
    Ok(())
}
