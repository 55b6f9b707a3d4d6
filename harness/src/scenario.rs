// Copyright 2024 Oxide Computer Company
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byte_unit::{Byte, UnitType};
use serde::{Deserialize, Serialize};
use slog::{error, info, o, warn, Logger};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::fault;
use crate::lifecycle::{Lifecycle, Resource, Volume};
use crate::load::{self, FioJob, Timeline, TimelineEntry};
use crate::node::{ChildState, Connector, GrpcConnector, Nexus, NexusState};
use crate::nvme::NvmfUri;
use crate::registry::Cluster;
use crate::runner::{client_runner, CommandRunner, LocalRunner};
use crate::substrate::{DockerSubstrate, Substrate};
use crate::topology::{MirrorTopology, NullNexusTopology, Provisioned};
use crate::{Error, Result};

/// Everything a scenario runs against, built once up front.
pub struct ClusterContext {
    pub log: Logger,
    pub config: HarnessConfig,
    pub cluster: Cluster,
    pub substrate: Arc<dyn Substrate>,
    /// Where NVMe connections are made and fio runs.
    pub client: Arc<dyn CommandRunner>,
}

impl ClusterContext {
    /// Docker containers reached over gRPC, with the client picked by
    /// `load.target_vm`.
    pub async fn connect(log: &Logger, config: HarnessConfig) -> Result<Self> {
        let local: Arc<dyn CommandRunner> = Arc::new(LocalRunner::new(log));
        let substrate: Arc<dyn Substrate> = Arc::new(DockerSubstrate::new(
            log,
            &config.cluster.network,
            local,
        ));
        let connector = GrpcConnector::new(config.rpc_timeout());
        let client = client_runner(log, config.load.target_vm.as_deref());
        Self::with_parts(log, config, substrate, &connector, client).await
    }

    pub async fn with_parts(
        log: &Logger,
        config: HarnessConfig,
        substrate: Arc<dyn Substrate>,
        connector: &dyn Connector,
        client: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let cluster = Cluster::connect(
            log,
            substrate.as_ref(),
            connector,
            &config.cluster.nodes,
            config.cluster.grpc_port,
        )
        .await?;
        Ok(ClusterContext {
            log: log.clone(),
            config,
            cluster,
            substrate,
            client,
        })
    }

    fn output_path(&self, file: &str) -> PathBuf {
        self.config.scenario.output_dir.join(file)
    }

    fn ledger_path(&self) -> PathBuf {
        self.output_path("ledger.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildReport {
    pub uri: String,
    /// The node the child lives on, when it maps to one.
    pub node: Option<String>,
    pub state: String,
}

/// The outcome of a scenario, written as JSON to the output directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioReport {
    pub scenario: String,
    pub passed: bool,
    pub error: Option<String>,
    pub nexus_uuid: Option<Uuid>,
    pub nexus_state: Option<String>,
    pub children: Vec<ChildReport>,
    pub timeline: Vec<TimelineEntry>,
    pub teardown_failures: usize,
}

impl ScenarioReport {
    fn new(scenario: &str) -> Self {
        ScenarioReport {
            scenario: scenario.to_string(),
            passed: false,
            error: None,
            nexus_uuid: None,
            nexus_state: None,
            children: Vec::new(),
            timeline: Vec::new(),
            teardown_failures: 0,
        }
    }

    fn observe(&mut self, cluster: &Cluster, nexus: &Nexus) {
        self.nexus_uuid = nexus.uuid.parse().ok();
        self.nexus_state = Some(nexus.state().as_str_name().to_string());
        self.children = nexus
            .children
            .iter()
            .map(|c| ChildReport {
                uri: c.uri.clone(),
                node: cluster.node_for_uri(&c.uri).map(|n| n.name.clone()),
                state: c.state().as_str_name().to_string(),
            })
            .collect();
    }

    /// Record how the run ended and write the report.  A report that
    /// cannot be written is logged, it does not change the outcome.
    fn finish(mut self, ctx: &ClusterContext, error: Option<&Error>) -> Self {
        self.passed = error.is_none();
        self.error = error.map(|e| e.to_string());

        let path = ctx.output_path(&format!("{}.json", self.scenario));
        if let Err(e) = write_report(&path, &self) {
            warn!(ctx.log, "unable to write {:?}: {:#}", path, e);
        }
        self
    }
}

fn write_report(path: &Path, report: &ScenarioReport) -> anyhow::Result<()> {
    harness_common::mkdir_for_file(path)?;
    harness_common::write_json(path, report, true)
}

/// Find `uuid` in the nexus list of `node`.
async fn find_nexus(
    cluster: &Cluster,
    node: &str,
    uuid: &Uuid,
) -> Result<Nexus> {
    let want = uuid.to_string();
    cluster
        .api(node)?
        .nexus_list()
        .await?
        .into_iter()
        .find(|n| n.uuid == want)
        .ok_or_else(|| {
            Error::Assertion(format!("nexus {} not listed on {}", uuid, node))
        })
}

/// The nexus must be degraded, with the child at `faulted_uri` faulted and
/// every other child still online.
pub fn check_degraded(nexus: &Nexus, faulted_uri: &str) -> Result<()> {
    if nexus.state() != NexusState::NexusDegraded {
        return Err(Error::Assertion(format!(
            "nexus {} is {}, expected NEXUS_DEGRADED",
            nexus.uuid,
            nexus.state().as_str_name()
        )));
    }

    let mut found = false;
    for child in nexus.children.iter() {
        let want = if child.uri == faulted_uri {
            found = true;
            ChildState::ChildFaulted
        } else {
            ChildState::ChildOnline
        };
        if child.state() != want {
            return Err(Error::Assertion(format!(
                "child {} is {}, expected {}",
                child.uri,
                child.state().as_str_name(),
                want.as_str_name()
            )));
        }
    }
    if !found {
        return Err(Error::Assertion(format!(
            "nexus {} has no child {}",
            nexus.uuid, faulted_uri
        )));
    }
    Ok(())
}

/// Kill one replica node while fio writes to the nexus.
///
/// The mirror is built, the nexus connected on the client, then the load
/// and the kill run concurrently under the scenario timeout.  Afterwards
/// the nexus must be degraded with exactly the killed node's child
/// faulted.  Teardown runs whatever happened.
pub async fn kill_one(ctx: &ClusterContext) -> Result<ScenarioReport> {
    let log = ctx.log.new(o!("scenario" => "kill-one"));
    let mut report = ScenarioReport::new("kill-one");
    let timeline = Timeline::new();

    let topo = MirrorTopology::from_config(&ctx.config);
    let (p, mut teardown) =
        match topo.build(&log, &ctx.cluster, ctx.client.clone()).await {
            Ok(built) => built,
            Err(e) => {
                report.finish(ctx, Some(&e));
                return Err(e);
            }
        };

    let result = run_kill_one(
        ctx,
        &log,
        &p,
        teardown.lifecycle_mut(),
        &timeline,
        &mut report,
    )
    .await;

    report.teardown_failures = teardown.run().await;
    report.timeline = timeline.entries();
    match &result {
        Ok(()) => info!(log, "passed"),
        Err(e) => error!(log, "failed: {}", e),
    }
    let report = report.finish(ctx, result.as_ref().err());
    result.map(|()| report)
}

async fn run_kill_one(
    ctx: &ClusterContext,
    log: &Logger,
    p: &Provisioned,
    lc: &mut Lifecycle,
    timeline: &Timeline,
    report: &mut ScenarioReport,
) -> Result<()> {
    let cfg = &ctx.config;
    let victim = cfg.fault.node.as_str();
    let victim_uri = p.replica_on(victim).ok_or_else(|| {
        Error::Setup(format!("{} holds no replica of the nexus", victim))
    })?;

    let uri = NvmfUri::parse(&p.device_uri)?;
    let dev = lc.connect(&uri).await?;
    let job =
        FioJob::new(&cfg.load.name, cfg.load.rw, cfg.load.runtime(), &dev);

    let load = load::run_job(log, ctx.client.as_ref(), &job, timeline);
    let kill = fault::kill_after(
        log,
        ctx.substrate.as_ref(),
        victim,
        cfg.fault.delay(),
        timeline,
    );
    let limit = cfg.scenario.timeout();
    let joined =
        tokio::time::timeout(limit, async { tokio::join!(load, kill) }).await;
    let Ok((load_res, kill_res)) = joined else {
        error!(log, "no result within {:?}, stopping fio", limit);
        load::stop_job(log, ctx.client.as_ref(), &job).await;
        return Err(Error::Timeout(limit));
    };
    load_res?;
    kill_res?;

    let nexus = find_nexus(&ctx.cluster, &p.target, &p.nexus_uuid).await?;
    report.observe(&ctx.cluster, &nexus);
    info!(
        log,
        "nexus {} is {}",
        nexus.uuid,
        nexus.state().as_str_name()
    );
    check_degraded(&nexus, victim_uri)?;

    if !timeline.fault_during_load() {
        return Err(Error::Assertion(format!(
            "kill of {} did not land while the load was running",
            victim
        )));
    }
    Ok(())
}

/// Ask for a volume bigger than the pools can hold.  The allocation must
/// fail with an out of space error and leave no replica behind.
pub async fn enospc(ctx: &ClusterContext) -> Result<ScenarioReport> {
    let log = ctx.log.new(o!("scenario" => "enospc"));
    let mut report = ScenarioReport::new("enospc");
    let mut lc = Lifecycle::new(&log, &ctx.cluster, ctx.client.clone());

    let result = run_enospc(ctx, &log, &mut lc, &mut report).await;

    report.teardown_failures = lc.teardown().await;
    let report = report.finish(ctx, result.as_ref().err());
    result.map(|()| report)
}

async fn run_enospc(
    ctx: &ClusterContext,
    log: &Logger,
    lc: &mut Lifecycle,
    report: &mut ScenarioReport,
) -> Result<()> {
    let cfg = &ctx.config;
    for node in cfg.replica.nodes.iter() {
        lc.create_pool(node, &cfg.pool.name, &cfg.pool.uri).await?;
    }

    let volume = Volume {
        uuid: Uuid::new_v4(),
        target: cfg.nexus.node.clone(),
        pools: cfg
            .replica
            .nodes
            .iter()
            .map(|n| (n.clone(), cfg.pool.name.clone()))
            .collect(),
        size_mb: cfg.scenario.enospc_size_mb,
    };
    report.nexus_uuid = Some(volume.uuid);

    match volume.create(lc).await {
        Ok(uri) => {
            return Err(Error::Assertion(format!(
                "{} MiB volume was created at {}, expected it to not fit",
                volume.size_mb, uri
            )));
        }
        Err(e) if e.is_resource_exhausted() => {
            info!(log, "volume refused as expected: {}", e);
        }
        Err(e) => return Err(e),
    }

    let want = volume.uuid.to_string();
    for node in cfg.replica.nodes.iter() {
        let replicas = ctx.cluster.api(node)?.replica_list().await?;
        if replicas.iter().any(|r| r.uuid == want) {
            return Err(Error::Assertion(format!(
                "replica {} left on {} after a failed volume",
                want, node
            )));
        }
    }
    Ok(())
}

/// Many nexus devices over null bdevs, all connected on the client at
/// once.  Every nexus must be listed online.
pub async fn multi_nexus(ctx: &ClusterContext) -> Result<ScenarioReport> {
    let log = ctx.log.new(o!("scenario" => "multi-nexus"));
    let mut report = ScenarioReport::new("multi-nexus");

    let topo = NullNexusTopology::from_config(&ctx.config);
    let (published, mut teardown) =
        match topo.build(&log, &ctx.cluster, ctx.client.clone()).await {
            Ok(built) => built,
            Err(e) => {
                report.finish(ctx, Some(&e));
                return Err(e);
            }
        };

    let result =
        run_multi_nexus(ctx, &topo, &published, teardown.lifecycle_mut())
            .await;

    report.teardown_failures = teardown.run().await;
    let report = report.finish(ctx, result.as_ref().err());
    result.map(|()| report)
}

async fn run_multi_nexus(
    ctx: &ClusterContext,
    topo: &NullNexusTopology,
    published: &[(Uuid, NvmfUri)],
    lc: &mut Lifecycle,
) -> Result<()> {
    let target_ip = ctx.cluster.ip(&topo.target)?.to_string();
    let port = published
        .first()
        .map(|(_, u)| u.port)
        .unwrap_or(storage_control_client::DEFAULT_NVMF_PORT);
    let targets: Vec<NvmfUri> =
        published.iter().map(|(_, u)| u.clone()).collect();
    lc.connect_all(&target_ip, port, &targets).await?;

    let listed = ctx.cluster.api(&topo.target)?.nexus_list().await?;
    let ours: Vec<Uuid> = published.iter().map(|(u, _)| *u).collect();
    check_online(&topo.target, &listed, &ours)
}

/// Each of `ours` must be listed on `target` and online.  Other nexus
/// devices the node happens to hold are not counted.
fn check_online(target: &str, listed: &[Nexus], ours: &[Uuid]) -> Result<()> {
    let missing: Vec<String> = ours
        .iter()
        .filter(|uuid| {
            let uuid = uuid.to_string();
            !listed.iter().any(|n| {
                n.uuid == uuid && n.state() == NexusState::NexusOnline
            })
        })
        .map(|uuid| uuid.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Assertion(format!(
            "{} of {} nexus devices not online on {}: {}",
            missing.len(),
            ours.len(),
            target,
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Build the mirror and leave it in place.  The ledger is saved so that
/// [`destroy`] can take it down later.
pub async fn create(ctx: &ClusterContext) -> Result<Provisioned> {
    let path = ctx.ledger_path();
    if path.exists() {
        return Err(Error::Config(format!(
            "{:?} exists, destroy what it records first",
            path
        )));
    }

    let topo = MirrorTopology::from_config(&ctx.config);
    let (p, teardown) =
        topo.build(&ctx.log, &ctx.cluster, ctx.client.clone()).await?;
    let ledger = teardown.into_ledger();
    harness_common::mkdir_for_file(&path).map_err(Error::file)?;
    harness_common::write_json(&path, &ledger, false).map_err(Error::file)?;
    info!(ctx.log, "{} resources recorded in {:?}", ledger.len(), path);
    Ok(p)
}

/// Destroy everything a previous [`create`] recorded.  Returns the number
/// of resources that could not be destroyed; those stay in the ledger.
pub async fn destroy(ctx: &ClusterContext) -> Result<usize> {
    let path = ctx.ledger_path();
    let ledger: Vec<Resource> =
        harness_common::read_json(&path).map_err(Error::file)?;
    let lc = Lifecycle::from_ledger(
        &ctx.log,
        &ctx.cluster,
        ctx.client.clone(),
        ledger,
    );
    let (failed, left) = lc.teardown_leftovers().await;
    if left.is_empty() {
        std::fs::remove_file(&path)?;
    } else {
        // Keep track of what survived so another destroy can retry it.
        harness_common::write_json(&path, &left, true).map_err(Error::file)?;
        warn!(ctx.log, "{} resources left in {:?}", left.len(), path);
    }
    Ok(failed)
}

/// Per node summary for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub reachable: bool,
    pub pools: Vec<String>,
    pub replicas: usize,
    pub nexus: Vec<String>,
    pub bdevs: usize,
}

fn human(bytes: u64) -> String {
    format!(
        "{:.1}",
        Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary)
    )
}

/// What every node currently holds.  A node that does not answer is
/// reported, not treated as an error.
pub async fn status(ctx: &ClusterContext) -> Vec<NodeStatus> {
    let mut out = Vec::new();
    for name in ctx.cluster.names() {
        let st = match node_status(&ctx.cluster, name).await {
            Ok(st) => st,
            Err(e) => {
                warn!(ctx.log, "{} did not answer: {}", name, e);
                NodeStatus {
                    node: name.to_string(),
                    reachable: false,
                    pools: Vec::new(),
                    replicas: 0,
                    nexus: Vec::new(),
                    bdevs: 0,
                }
            }
        };
        out.push(st);
    }
    out
}

async fn node_status(cluster: &Cluster, name: &str) -> Result<NodeStatus> {
    let api = cluster.api(name)?;
    let pools = api
        .pool_list()
        .await?
        .iter()
        .map(|p| {
            format!(
                "{} {} {}/{}",
                p.name,
                p.state().as_str_name(),
                human(p.used),
                human(p.capacity)
            )
        })
        .collect();
    let replicas = api.replica_list().await?.len();
    let nexus = api
        .nexus_list()
        .await?
        .iter()
        .map(|n| format!("{} {}", n.uuid, n.state().as_str_name()))
        .collect();
    let bdevs = api.bdev_list().await?.len();
    Ok(NodeStatus {
        node: name.to_string(),
        reachable: true,
        pools,
        replicas,
        nexus,
        bdevs,
    })
}

/// Kill `node` right away.
pub async fn kill(ctx: &ClusterContext, node: &str) -> Result<()> {
    ctx.cluster.node(node)?;
    ctx.substrate.kill(node).await
}
