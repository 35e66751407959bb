// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod topology;
use topology::Topology;

mod interrupts;
use interrupts::HintPolicy;
use interrupts::IrqProvider;
use interrupts::IrqRegistry;
use interrupts::SysfsIrqProvider;

mod policy;
use policy::DefaultPolicy;
use policy::PolicyProvider;
use policy::ScriptPolicy;

mod accounting;
use accounting::CounterSource;
use accounting::LoadAccounting;
use accounting::ProcCounters;
use accounting::SampleOutcome;

mod balancer;
use balancer::Balancer;

mod placement;
use placement::PendingPool;

mod activate;
use activate::AffinitySink;
use activate::ProcAffinity;

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use irq_utils::Cpumask;
use irq_utils::HostTopology;
use log::debug;
use log::info;
use log::warn;

/// irqbalance: distribute hardware interrupts across CPUs
///
/// Every interval the daemon samples interrupt counts and per-CPU interrupt
/// servicing time, works out which CPUs, caches, packages and NUMA nodes are
/// overloaded, and moves interrupts away from them by rewriting
/// /proc/irq/N/smp_affinity.
///
/// Interrupts are moved only within the topology level their device class
/// allows. Drivers can pin interrupts through affinity_hint, which is
/// honored according to --hintpolicy, and a policy script can override the
/// handling of every interrupt.
#[derive(Debug, Parser)]
#[command(disable_help_flag = true)]
struct Opts {
    /// Balance once and exit.
    #[clap(
        short = 'o',
        long,
        env = "IRQBALANCE_ONESHOT",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    oneshot: bool,

    /// Dump the topology and run placement validation every cycle.
    #[clap(
        short = 'd',
        long,
        env = "IRQBALANCE_DEBUG",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    debug: bool,

    /// Stay in the foreground. This is always the case, the flag is accepted
    /// for compatibility.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    foreground: bool,

    /// How the affinity_hint of a driver is honored. exact: the hint is
    /// written as is. subset: placement is restricted to CPUs in the hint.
    /// ignore: the hint plays no role.
    #[clap(short = 'h', long, value_enum, default_value = "ignore")]
    hintpolicy: HintPolicy,

    /// Number of idle CPUs needed, with no CPU overloaded, before a CPU is
    /// emptied of interrupts to save power. "off" disables powersave.
    #[clap(short = 'p', long, default_value = "off")]
    powerthresh: String,

    /// Never balance this irq. Can be repeated.
    #[clap(short = 'i', long)]
    banirq: Vec<u32>,

    /// Deepest cache index CPUs are grouped by.
    #[clap(
        short = 'c',
        long,
        default_value = "2",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    deepestcache: u64,

    /// Executable consulted for every irq as `<script> <devpath> <irq>`.
    #[clap(short = 'l', long)]
    policyscript: Option<PathBuf>,

    /// Write the process id to this file.
    #[clap(short = 's', long)]
    pid: Option<PathBuf>,

    /// Hex mask of CPUs no interrupt is ever placed on.
    #[clap(long, env = "IRQBALANCE_BANNED_CPUS")]
    banned_cpus: Option<String>,

    /// Balancing interval in seconds.
    #[clap(long, default_value = "10")]
    interval: u64,

    /// Root of the sysfs tree.
    #[clap(long, default_value = "/sys")]
    sysfs: PathBuf,

    /// Root of the procfs tree.
    #[clap(long, default_value = "/proc")]
    procfs: PathBuf,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print help.
    #[clap(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

fn parse_power_thresh(val: &str) -> Result<Option<usize>> {
    if val.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let thresh = val
        .parse::<usize>()
        .with_context(|| format!("Invalid powerthresh {:?}", val))?;
    Ok(Some(thresh))
}

fn read_topology(sysfs: &Path, deepest_cache: usize, banned_cpus: &Cpumask) -> Result<Topology> {
    let host =
        HostTopology::read(sysfs, deepest_cache).context("Failed to read the cpu topology")?;
    Topology::build(&host, banned_cpus)
}

/// Where the daemon reads its inputs from and writes its decisions to.
struct Backends {
    provider: Box<dyn IrqProvider>,
    policy: Box<dyn PolicyProvider>,
    counters: Box<dyn CounterSource>,
    sink: Box<dyn AffinitySink>,
}

impl Backends {
    fn new(opts: &Opts) -> Self {
        let policy: Box<dyn PolicyProvider> = match &opts.policyscript {
            Some(script) => Box::new(ScriptPolicy::new(script)),
            None => Box::new(DefaultPolicy),
        };
        Self {
            provider: Box::new(SysfsIrqProvider::new(&opts.sysfs, &opts.procfs)),
            policy,
            counters: Box::new(ProcCounters::new(&opts.procfs)),
            sink: Box::new(ProcAffinity::new(&opts.procfs)),
        }
    }
}

/// Removes the pid file on drop.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pid file {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove pid file {:?}: {}", self.path, e);
        }
    }
}

struct IrqBalancer {
    sysfs: PathBuf,
    deepest_cache: usize,
    banned_cpus: Cpumask,
    interval: Duration,
    oneshot: bool,
    debug: bool,

    backends: Backends,
    topo: Topology,
    reg: IrqRegistry,
    pool: PendingPool,
    accounting: LoadAccounting,
    balancer: Balancer,

    cycle_count: u64,
    need_rescan: bool,
    shutdown: Arc<AtomicBool>,
}

impl IrqBalancer {
    fn init(opts: &Opts, backends: Backends, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let banned_cpus = match &opts.banned_cpus {
            Some(mask) => Cpumask::from_str(mask)
                .with_context(|| format!("Invalid banned cpu mask {:?}", mask))?,
            None => Cpumask::new(),
        };
        if !banned_cpus.is_empty() {
            info!("Banned cpus: {}", banned_cpus);
        }

        let deepest_cache = opts.deepestcache as usize;
        let mut topo = read_topology(&opts.sysfs, deepest_cache, &banned_cpus)?;

        let mut reg = IrqRegistry::new(opts.hintpolicy);
        for &irq in opts.banirq.iter() {
            reg.ban_from_command_line(&mut topo, irq);
        }

        let mut balancer = Self {
            sysfs: opts.sysfs.clone(),
            deepest_cache,
            banned_cpus,
            interval: Duration::from_secs(opts.interval),
            oneshot: opts.oneshot,
            debug: opts.debug,
            backends,
            topo,
            reg,
            pool: PendingPool::new(),
            accounting: LoadAccounting::new(),
            balancer: Balancer::new(parse_power_thresh(&opts.powerthresh)?),
            cycle_count: 0,
            need_rescan: false,
            shutdown,
        };
        balancer.collect_interrupts()?;
        Ok(balancer)
    }

    /// Rebuild the topology and the interrupt registry from scratch.
    fn rebuild(&mut self) -> Result<()> {
        self.topo.clear();
        self.topo = read_topology(&self.sysfs, self.deepest_cache, &self.banned_cpus)?;
        self.collect_interrupts()
    }

    fn collect_interrupts(&mut self) -> Result<()> {
        self.pool.clear();
        self.reg
            .rebuild(
                self.backends.provider.as_ref(),
                self.backends.policy.as_ref(),
                &self.topo,
            )
            .context("Failed to collect interrupts")?;

        info!(
            "Found {} cpus and {} interrupts",
            self.topo.count(),
            self.reg.len()
        );
        if self.debug {
            self.topo.dump();
            self.reg.dump(&self.topo);
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<()> {
        let outcome = self.accounting.sample(
            self.backends.counters.as_mut(),
            &mut self.topo,
            &mut self.reg,
        )?;
        if outcome == SampleOutcome::Rescan {
            self.need_rescan = true;
        }
        Ok(())
    }

    fn clear_work_stats(&mut self) {
        self.topo.clear_work_stats();
        self.reg.clear_work_stats();
    }

    /// Sleep for one interval or until shutdown is requested.
    fn sleep(&self) {
        let deadline = Instant::now() + self.interval;
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    fn rescan(&mut self) -> Result<()> {
        info!("Rescanning cpu topology");
        self.need_rescan = false;
        self.cycle_count = 0;
        self.rebuild()?;
        self.pool.seed(&mut self.topo, &mut self.reg);

        // Two samples, an interval apart, to establish a baseline.
        self.sample()?;
        self.sleep();
        self.clear_work_stats();
        self.sample()
    }

    /// One balancing cycle, minus the sleep in front of it.
    fn step(&mut self) -> Result<()> {
        self.clear_work_stats();
        self.sample()?;

        if self.need_rescan {
            self.rescan()?;
        }

        if self.cycle_count > 0 {
            self.balancer.balance(
                &mut self.topo,
                &mut self.reg,
                &mut self.pool,
                self.cycle_count,
            );
        }

        placement::place(&mut self.topo, &mut self.reg, &mut self.pool);
        if !self.pool.is_empty() {
            debug!(
                "{} irqs left unplaced: {:?}",
                self.pool.len(),
                self.pool.iter().collect::<Vec<_>>()
            );
        }

        let written = activate::activate(&self.topo, &mut self.reg, self.backends.sink.as_mut());
        debug!("Changed the affinity of {} irqs", written);

        if self.debug {
            self.topo.dump();
            self.reg.dump(&self.topo);
            let errors = placement::validate(&self.topo, &self.reg);
            if errors > 0 {
                warn!("{} irqs failed placement validation", errors);
            }
        }
        Ok(())
    }

    fn run(&mut self, hup: Arc<AtomicBool>) -> Result<()> {
        self.pool.seed(&mut self.topo, &mut self.reg);
        self.sample()?;

        while !self.shutdown.load(Ordering::Relaxed) {
            self.sleep();

            if hup.swap(false, Ordering::Relaxed) && self.cycle_count > 0 {
                info!("SIGHUP received, rescanning");
                self.need_rescan = true;
            }

            self.step()?;

            if self.oneshot {
                break;
            }
            self.cycle_count += 1;
        }

        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match (opts.verbose, opts.debug) {
        (0, false) => simplelog::LevelFilter::Info,
        (0, true) | (1, _) => simplelog::LevelFilter::Debug,
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

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let hup = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGHUP, hup.clone())
        .context("Error setting SIGHUP handler")?;

    if opts.foreground {
        debug!("--foreground is implied");
    }

    let mut balancer = IrqBalancer::init(&opts, Backends::new(&opts), shutdown)?;
    if balancer.topo.count() < 2 {
        warn!("Balancing is ineffective on systems with a single cpu. Shutting down");
        return Ok(());
    }

    let _pid_file = match &opts.pid {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    balancer.run(hup)
}
