use crate::{
    batch_driver::{BatchDriver, BatchResult},
    desired_state::DesiredStateProvider,
    errors::ControllerError,
    resource_accessor::ResourceAccessor,
    utils::metric_name,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use rustrial_k8s_label_reconciler_apis::ClusterIdentity;
use std::time::Instant;
use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

const POLL_SCHEDULER: &'static str = "poll_scheduler";

/// Periodically fetches the desired label state and applies it to the target cluster.
///
/// Exactly one batch is in flight at any time, a cycle overrunning the poll
/// interval delays the next one.
pub(crate) struct PollScheduler<P, A> {
    provider: P,
    driver: BatchDriver<A>,
    cluster: ClusterIdentity,
    interval: Duration,
    cycle_count: Counter<u64>,
    cycle_errors: Counter<u64>,
    cycle_duration: Histogram<u64>,
}

impl<P, A> PollScheduler<P, A>
where
    P: DesiredStateProvider + 'static,
    A: ResourceAccessor + 'static,
{
    pub fn new(
        provider: P,
        driver: BatchDriver<A>,
        cluster: ClusterIdentity,
        interval: Duration,
    ) -> Self {
        let meter: Meter = global::meter(POLL_SCHEDULER);
        let cycle_count = meter
            .u64_counter(metric_name("poll_cycle_count"))
            .with_description("Count of poll cycles")
            .build();
        let cycle_errors = meter
            .u64_counter(metric_name("poll_cycle_errors"))
            .with_description("Count of poll cycles which failed to fetch or apply the desired state")
            .build();
        let cycle_duration = meter
            .u64_histogram(metric_name("poll_cycle_duration_ms"))
            .with_description("Duration of poll cycles in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            provider,
            driver,
            cluster,
            interval,
            cycle_count,
            cycle_errors,
            cycle_duration,
        }
    }

    /// Spawn the poll loop, which runs until `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "polling desired label state of {} every {:?}",
            self.cluster, self.interval
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => (),
            }
            self.cycle().await;
        }
        info!("stopped polling desired label state of {}", self.cluster);
    }

    async fn cycle(&self) {
        let start = Instant::now();
        let result = self.try_cycle().await;
        let status = match result {
            Ok(result) => {
                info!("applied desired label state of {}: {}", self.cluster, result);
                "success"
            }
            Err(e) => {
                error!("failed to apply desired label state of {}: {}", self.cluster, e);
                self.cycle_errors.add(1, &[]);
                "failure"
            }
        };
        let labels = &[KeyValue::new("status", status)];
        self.cycle_count.add(1, labels);
        self.cycle_duration
            .record(start.elapsed().as_millis() as u64, labels);
    }

    async fn try_cycle(&self) -> Result<BatchResult, ControllerError> {
        let patches = self.provider.fetch(&self.cluster).await?;
        debug!("received {} resource patches", patches.len());
        self.driver.apply_batch(&patches).await.into_result()
    }
}
