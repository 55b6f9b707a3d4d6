// Copyright 2024 Oxide Computer Company
use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use slog::{info, Level, Logger};
use tokio::runtime::Builder;

use harness_common::{build_logger_with, LogFormat};
use nexus_harness::config::HarnessConfig;
use nexus_harness::load::Workload;
use nexus_harness::scenario::{self, ClusterContext, ScenarioReport};

/// Fault injection harness for mirrored nexus devices
#[derive(Debug, Parser)]
#[clap(name = "nexus-harness", term_width = 80)]
#[clap(about = "Kill storage nodes under load and check the nexus copes",
    long_about = None)]
struct Args {
    /// TOML configuration file.  Built in defaults are used without one.
    #[clap(long, short, global = true, action)]
    config: Option<PathBuf>,

    /// Log output: term or bunyan
    #[clap(long, global = true, default_value = "term", action)]
    log_format: LogFormat,

    /// Log level: trace, debug, info, warn, error or crit
    #[clap(long, global = true, default_value = "info", action)]
    log_level: String,

    /// Remote client the nexus is connected on and fio runs on.  The local
    /// host is used when unset.
    #[clap(long, global = true, env = "TARGET_VM", action)]
    target_vm: Option<String>,

    /// Directory reports and the resource ledger are written to
    #[clap(long, global = true, action)]
    output_dir: Option<PathBuf>,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Kill a replica node during an fio run and check the nexus degrades
    KillOne {
        /// Replica node to kill
        #[clap(long, action)]
        node: Option<String>,

        /// Seconds into the load to kill the node
        #[clap(long, action)]
        delay: Option<u64>,

        /// Seconds fio runs for
        #[clap(long, action)]
        runtime: Option<u64>,

        /// fio I/O pattern (read, write, randread, randwrite, rw, randrw)
        #[clap(long, action)]
        rw: Option<Workload>,
    },
    /// Check that a volume larger than the pools is refused
    Enospc {
        /// Size of the volume to request
        #[clap(long, action)]
        size_mb: Option<u64>,
    },
    /// Publish many nexus devices over null bdevs and connect them all
    MultiNexus {
        /// Null devices per replica node, and nexus devices on the target
        #[clap(long, action)]
        count: Option<usize>,
    },
    /// Build the mirror and leave it in place
    Create,
    /// Destroy what create built
    Destroy,
    /// Show what each node holds
    Status,
    /// Kill a node now
    Kill {
        #[clap(action)]
        node: String,
    },
}

fn parse_level(s: &str) -> Result<Level> {
    s.parse::<Level>()
        .map_err(|_| anyhow!("not a valid log level: {}", s))
}

/// Fold command line overrides into the file (or default) configuration.
fn configure(args: &Args) -> Result<HarnessConfig> {
    let mut cfg = match &args.config {
        Some(path) => HarnessConfig::from_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(vm) = &args.target_vm {
        cfg.load.target_vm = Some(vm.clone());
    }
    if let Some(dir) = &args.output_dir {
        cfg.scenario.output_dir = dir.clone();
    }

    match &args.action {
        Action::KillOne {
            node,
            delay,
            runtime,
            rw,
        } => {
            if let Some(node) = node {
                cfg.fault.node = node.clone();
            }
            if let Some(delay) = delay {
                cfg.fault.delay_secs = *delay;
            }
            if let Some(runtime) = runtime {
                cfg.load.runtime_secs = *runtime;
            }
            if let Some(rw) = rw {
                cfg.load.rw = *rw;
            }
        }
        Action::Enospc { size_mb: Some(size) } => {
            cfg.scenario.enospc_size_mb = *size;
        }
        Action::MultiNexus { count: Some(count) } => {
            cfg.scenario.null_devices = *count;
        }
        _ => {}
    }
    Ok(cfg)
}

fn summarize(log: &Logger, report: &ScenarioReport) {
    info!(
        log,
        "{}: {}",
        report.scenario,
        if report.passed { "PASS" } else { "FAIL" }
    );
    for c in report.children.iter() {
        info!(
            log,
            "  child {} on {}: {}",
            c.uri,
            c.node.as_deref().unwrap_or("?"),
            c.state
        );
    }
    if report.teardown_failures > 0 {
        info!(
            log,
            "{} teardown steps failed, see the log",
            report.teardown_failures
        );
    }
}

async fn run(log: &Logger, cfg: HarnessConfig, action: Action) -> Result<()> {
    let ctx = ClusterContext::connect(log, cfg).await?;

    match action {
        Action::KillOne { .. } => {
            let report = scenario::kill_one(&ctx).await?;
            summarize(log, &report);
        }
        Action::Enospc { .. } => {
            let report = scenario::enospc(&ctx).await?;
            summarize(log, &report);
        }
        Action::MultiNexus { .. } => {
            let report = scenario::multi_nexus(&ctx).await?;
            summarize(log, &report);
        }
        Action::Create => {
            let p = scenario::create(&ctx).await?;
            println!("nexus {} on {}", p.nexus_uuid, p.target);
            println!("device {}", p.device_uri);
            for r in p.replicas.iter() {
                println!("replica on {}: {}", r.node, r.uri);
            }
        }
        Action::Destroy => {
            let failed = scenario::destroy(&ctx).await?;
            if failed > 0 {
                bail!("{} resources could not be destroyed", failed);
            }
        }
        Action::Status => {
            for st in scenario::status(&ctx).await {
                if !st.reachable {
                    println!("{:<6} unreachable", st.node);
                    continue;
                }
                println!(
                    "{:<6} bdevs:{:<4} replicas:{:<4}",
                    st.node, st.bdevs, st.replicas
                );
                for p in st.pools.iter() {
                    println!("       pool  {}", p);
                }
                for n in st.nexus.iter() {
                    println!("       nexus {}", n);
                }
            }
        }
        Action::Kill { node } => {
            scenario::kill(&ctx, &node).await?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = parse_level(&args.log_level)?;
    let log = build_logger_with(args.log_format, level);
    let cfg = configure(&args)?;

    let runtime = Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("nexus-harness")
        .enable_all()
        .build()?;

    runtime.block_on(run(&log, cfg, args.action))
}
