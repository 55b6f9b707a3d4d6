// Copyright 2024 Oxide Computer Company
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use tokio::time::Instant;

use crate::runner::{shell_quote, CommandRunner};
use crate::Result;

/// fio I/O patterns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    Read,
    Write,
    RandRead,
    #[default]
    RandWrite,
    Rw,
    RandRw,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Workload::Read => "read",
            Workload::Write => "write",
            Workload::RandRead => "randread",
            Workload::RandWrite => "randwrite",
            Workload::Rw => "rw",
            Workload::RandRw => "randrw",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Workload {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "read" => Ok(Workload::Read),
            "write" => Ok(Workload::Write),
            "randread" => Ok(Workload::RandRead),
            "randwrite" => Ok(Workload::RandWrite),
            "rw" => Ok(Workload::Rw),
            "randrw" => Ok(Workload::RandRw),
            _ => Err(format!("unknown workload {:?}", s)),
        }
    }
}

/// A time based fio job against a single block device.
#[derive(Debug, Clone)]
pub struct FioJob {
    pub name: String,
    pub rw: Workload,
    pub runtime: Duration,
    pub filename: String,
    pub block_size: String,
    pub iodepth: u32,
}

impl FioJob {
    pub fn new(
        name: &str,
        rw: Workload,
        runtime: Duration,
        filename: &str,
    ) -> Self {
        FioJob {
            name: name.to_string(),
            rw,
            runtime,
            filename: filename.to_string(),
            block_size: "4k".to_string(),
            iodepth: 64,
        }
    }

    /// Direct, asynchronous I/O for the full runtime no matter how much
    /// of the device has been covered.
    pub fn command(&self) -> String {
        format!(
            "sudo fio --ioengine=linuxaio --direct=1 --bs={} \
             --time_based=1 --rw={} --group_reporting=1 --norandommap=1 \
             --iodepth={} --runtime={} --name={} --filename={}",
            self.block_size,
            self.rw,
            self.iodepth,
            self.runtime.as_secs(),
            shell_quote(&self.name),
            shell_quote(&self.filename),
        )
    }

    /// SIGKILL every fio process running this job.  The bracket keeps the
    /// pattern from matching the pkill command line itself.
    pub fn kill_command(&self) -> String {
        let mut name = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if "\\.^$|?*+()[]{}".contains(c) {
                name.push('\\');
            }
            name.push(c);
        }
        let pattern = format!("[f]io .*--name={}( |$)", name);
        format!("sudo pkill -KILL -f {}", shell_quote(&pattern))
    }
}

/// What happened during a scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    LoadStarted,
    FaultFired,
    LoadFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Milliseconds since the timeline was created.
    pub at_ms: u64,
    pub event: Event,
}

/// Shared, ordered record of load and fault events.
#[derive(Debug, Clone)]
pub struct Timeline {
    start: Instant,
    events: Arc<Mutex<Vec<TimelineEntry>>>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    pub fn new() -> Self {
        Timeline {
            start: Instant::now(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, event: Event) {
        let at_ms = self.start.elapsed().as_millis() as u64;
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TimelineEntry { at_ms, event });
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn first(&self, event: Event) -> Option<u64> {
        self.entries()
            .into_iter()
            .find(|e| e.event == event)
            .map(|e| e.at_ms)
    }

    /// The fault landed after the load started and before it finished.
    pub fn fault_during_load(&self) -> bool {
        match (
            self.first(Event::LoadStarted),
            self.first(Event::FaultFired),
            self.first(Event::LoadFinished),
        ) {
            (Some(start), Some(fault), Some(end)) => {
                start <= fault && fault < end
            }
            _ => false,
        }
    }
}

/// Kill what is left of `job` on `runner`.  Dropping a command only stops
/// the local process, which for a remote client is the ssh session.
pub async fn stop_job(log: &Logger, runner: &dyn CommandRunner, job: &FioJob) {
    match runner.run(&job.kill_command()).await {
        Ok(_) => info!(log, "fio {} killed on {}", job.name, runner.host()),
        Err(e) => warn!(
            log,
            "fio {} not killed on {}: {}",
            job.name,
            runner.host(),
            e
        ),
    }
}

/// Run `job` to completion on `runner`.  The start and the end of the job
/// are recorded on `timeline`; a failed job records no end.
pub async fn run_job(
    log: &Logger,
    runner: &dyn CommandRunner,
    job: &FioJob,
    timeline: &Timeline,
) -> Result<()> {
    info!(
        log,
        "fio {} {} for {:?} on {}:{}",
        job.name,
        job.rw,
        job.runtime,
        runner.host(),
        job.filename
    );
    timeline.record(Event::LoadStarted);
    let out = runner.run(&job.command()).await?;
    timeline.record(Event::LoadFinished);
    info!(log, "fio {} done, {} bytes of output", job.name, out.stdout.len());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{csl, FakeRunner};

    #[test]
    fn fio_command_line() {
        let job = FioJob::new(
            "job1",
            Workload::RandWrite,
            Duration::from_secs(15),
            "/dev/nvme0n1",
        );
        assert_eq!(
            job.command(),
            "sudo fio --ioengine=linuxaio --direct=1 --bs=4k --time_based=1 \
             --rw=randwrite --group_reporting=1 --norandommap=1 \
             --iodepth=64 --runtime=15 --name=job1 --filename=/dev/nvme0n1"
        );
    }

    #[test]
    fn kill_matches_only_the_job() {
        let job = FioJob::new(
            "job1",
            Workload::RandWrite,
            Duration::from_secs(15),
            "/dev/nvme0n1",
        );
        assert_eq!(
            job.kill_command(),
            "sudo pkill -KILL -f '[f]io .*--name=job1( |$)'"
        );

        let odd = FioJob::new(
            "a.b",
            Workload::Rw,
            Duration::from_secs(1),
            "/dev/nvme0n1",
        );
        assert_eq!(
            odd.kill_command(),
            r"sudo pkill -KILL -f '[f]io .*--name=a\.b( |$)'"
        );
    }

    #[test]
    fn fio_arguments_are_quoted() {
        let job = FioJob::new(
            "my job",
            Workload::Read,
            Duration::from_secs(1),
            "/dev/nvme0n1",
        );
        assert!(job.command().ends_with(
            "--name='my job' --filename=/dev/nvme0n1"
        ));
    }

    #[test]
    fn workload_names() {
        for w in [
            Workload::Read,
            Workload::Write,
            Workload::RandRead,
            Workload::RandWrite,
            Workload::Rw,
            Workload::RandRw,
        ] {
            assert_eq!(w.to_string().parse::<Workload>().unwrap(), w);
        }
        assert!("sequential".parse::<Workload>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn overlap_detection() {
        let t = Timeline::new();
        t.record(Event::LoadStarted);
        tokio::time::sleep(Duration::from_secs(4)).await;
        t.record(Event::FaultFired);
        tokio::time::sleep(Duration::from_secs(11)).await;
        t.record(Event::LoadFinished);
        assert!(t.fault_during_load());
        assert_eq!(t.entries()[1].at_ms, 4000);

        let late = Timeline::new();
        late.record(Event::LoadStarted);
        late.record(Event::LoadFinished);
        tokio::time::sleep(Duration::from_secs(1)).await;
        late.record(Event::FaultFired);
        assert!(!late.fault_during_load());

        assert!(!Timeline::new().fault_during_load());
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_on_runner() {
        let runner = FakeRunner::new();
        runner.respond_after("fio", "", Duration::from_secs(15));
        let job = FioJob::new(
            "job1",
            Workload::Rw,
            Duration::from_secs(15),
            "/dev/nvme1n1",
        );
        let t = Timeline::new();
        run_job(&csl(), &runner, &job, &t).await.unwrap();

        let e = t.entries();
        assert_eq!(e.len(), 2);
        assert_eq!(e[0].event, Event::LoadStarted);
        assert_eq!(e[1].event, Event::LoadFinished);
        assert_eq!(e[1].at_ms, 15000);
        assert_eq!(runner.history(), vec![job.command()]);
    }

    #[tokio::test]
    async fn failed_job_has_no_end() {
        let runner = FakeRunner::new();
        runner.fail("fio");
        let job = FioJob::new(
            "job1",
            Workload::Rw,
            Duration::from_secs(1),
            "/dev/nvme1n1",
        );
        let t = Timeline::new();
        assert!(run_job(&csl(), &runner, &job, &t).await.is_err());
        assert_eq!(t.entries().len(), 1);
    }
}
