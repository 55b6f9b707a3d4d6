// Copyright 2024 Oxide Computer Company
use std::time::Duration;

use slog::{info, Logger};

use crate::load::{Event, Timeline};
use crate::substrate::Substrate;
use crate::Result;

/// Wait `delay`, then hard kill `node`.
///
/// The kill is not retried and nothing waits for the node to go away; the
/// instant it was issued is recorded on `timeline`.
pub async fn kill_after(
    log: &Logger,
    substrate: &dyn Substrate,
    node: &str,
    delay: Duration,
    timeline: &Timeline,
) -> Result<()> {
    tokio::time::sleep(delay).await;
    info!(log, "killing {} after {:?}", node, delay);
    timeline.record(Event::FaultFired);
    substrate.kill(node).await
}
