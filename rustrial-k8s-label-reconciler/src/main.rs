#[macro_use]
extern crate log;

use anyhow::Context;
use batch_driver::BatchDriver;
use desired_state::{DesiredStateSource, FileDesiredStateProvider, HttpDesiredStateProvider};
use errors::{ConfigError, ControllerError};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use ownership::AllowedPrefixSet;
use patch_executor::{PatchExecutor, RetryPolicy};
use poll_scheduler::PollScheduler;
use prometheus::Registry;
use prometheus_exporter::start_prometheus_metrics_server;
use resource_accessor::{KubeResourceAccessor, TargetCluster};
use rustrial_k8s_label_reconciler_apis::ClusterIdentity;
use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};
use tokio_util::sync::CancellationToken;

mod batch_driver;
mod desired_state;
mod errors;
mod label_diff;
mod ownership;
mod patch_executor;
mod poll_scheduler;
mod prometheus_exporter;
mod resource_accessor;
#[cfg(test)]
mod testing;
mod utils;

/// The K8s field manager name.
const MANAGER: &'static str = "rustrial-label-reconciler";

/// Where the desired label state is fetched from.
#[derive(Clone, Debug, PartialEq, Eq)]
enum DesiredStateLocation {
    Url(String),
    File(PathBuf),
}

#[derive(Clone, Debug)]
struct Configuration {
    poll_interval: Duration,
    target_cluster: TargetCluster,
    cluster: ClusterIdentity,
    allowed_prefixes: AllowedPrefixSet,
    desired_state: DesiredStateLocation,
    desired_state_timeout: Duration,
    retry: RetryPolicy,
    metrics_addr: SocketAddr,
}

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| var(name).ok_or(ConfigError::Missing(name));

        let poll_interval = Duration::from_secs(parse_positive(
            "POLL_INTERVAL_SECONDS",
            var("POLL_INTERVAL_SECONDS"),
            60,
        )?);
        let target_cluster = match var("TARGET_CLUSTER").as_deref() {
            None | Some("local") => TargetCluster::Local,
            Some("remote") => TargetCluster::Remote {
                kubeconfig: PathBuf::from(required("TARGET_KUBECONFIG")?),
            },
            Some(other) => Err(ConfigError::Invalid {
                name: "TARGET_CLUSTER",
                value: other.to_string(),
                reason: "expected local or remote".to_string(),
            })?,
        };
        let cluster = ClusterIdentity {
            cluster_id: required("CLUSTER_ID")?,
            region: required("REGION")?,
            availability_zone: required("AVAILABILITY_ZONE")?,
        };
        let allowed_prefixes = AllowedPrefixSet::parse(&required("ALLOWED_LABEL_PREFIXES")?);
        if allowed_prefixes.is_empty() {
            return Err(ConfigError::Invalid {
                name: "ALLOWED_LABEL_PREFIXES",
                value: var("ALLOWED_LABEL_PREFIXES").unwrap_or_default(),
                reason: "at least one label key prefix is required".to_string(),
            });
        }
        let desired_state = match (var("DESIRED_STATE_URL"), var("DESIRED_STATE_FILE")) {
            (Some(url), None) => DesiredStateLocation::Url(http_url("DESIRED_STATE_URL", url)?),
            (None, Some(file)) => DesiredStateLocation::File(PathBuf::from(file)),
            (Some(_), Some(_)) => Err(ConfigError::Conflict(
                "DESIRED_STATE_URL and DESIRED_STATE_FILE are mutually exclusive".to_string(),
            ))?,
            (None, None) => Err(ConfigError::Missing("DESIRED_STATE_URL"))?,
        };
        let desired_state_timeout = Duration::from_secs(parse_positive(
            "DESIRED_STATE_TIMEOUT_SECONDS",
            var("DESIRED_STATE_TIMEOUT_SECONDS"),
            30,
        )?);
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: parse_positive(
                "CONFLICT_RETRY_ATTEMPTS",
                var("CONFLICT_RETRY_ATTEMPTS"),
                defaults.attempts,
            )?,
            delay: Duration::from_millis(parse(
                "CONFLICT_RETRY_DELAY_MS",
                var("CONFLICT_RETRY_DELAY_MS"),
                defaults.delay.as_millis() as u64,
            )?),
        };
        let metrics_addr = var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let metrics_port = var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
        let metrics_addr = parse(
            "METRICS_LISTEN_ADDR",
            Some(format!("{}:{}", metrics_addr, metrics_port)),
            SocketAddr::from(([0, 0, 0, 0], 9000)),
        )?;
        Ok(Configuration {
            poll_interval,
            target_cluster,
            cluster,
            allowed_prefixes,
            desired_state,
            desired_state_timeout,
            retry,
            metrics_addr,
        })
    }

    fn desired_state_source(&self) -> Result<DesiredStateSource, ControllerError> {
        Ok(match &self.desired_state {
            DesiredStateLocation::Url(url) => DesiredStateSource::Http(
                HttpDesiredStateProvider::new(url.as_str(), self.desired_state_timeout)?,
            ),
            DesiredStateLocation::File(path) => {
                DesiredStateSource::File(FileDesiredStateProvider::new(path.clone()))
            }
        })
    }
}

fn parse<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

/// Accept only plain `http://` URLs with a host, the desired-state client does not speak TLS.
fn http_url(name: &'static str, value: String) -> Result<String, ConfigError> {
    let reason = match value.parse::<hyper::Uri>() {
        Ok(uri) if uri.scheme_str() == Some("http") && uri.host().is_some() => return Ok(value),
        Ok(_) => "expected an http:// URL".to_string(),
        Err(e) => e.to_string(),
    };
    Err(ConfigError::Invalid {
        name,
        value,
        reason,
    })
}

fn parse_positive<T>(name: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let v = parse(name, value, default)?;
    if v == T::default() {
        Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        })
    } else {
        Ok(v)
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env().context("invalid configuration")?;

    let registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_addr = configuration.metrics_addr;
    // The metrics endpoint is auxiliary, reconciliation continues without it.
    let prometheus_metrics_exporter = tokio::spawn(async move {
        if let Err(e) = start_prometheus_metrics_server(metrics_addr, registry).await {
            error!("metrics server on {} failed: {}", metrics_addr, e);
        }
    });

    // Without a reachable target cluster there is nothing useful to do, so fail hard.
    let client = configuration
        .target_cluster
        .client()
        .await
        .with_context(|| format!("failed to connect to {} cluster", configuration.target_cluster))?;
    info!(
        "applying label patches to {} cluster, allowed label prefixes: {}",
        configuration.target_cluster, configuration.allowed_prefixes
    );
    let provider = configuration.desired_state_source()?;
    info!("fetching desired label state from {}", provider);
    let executor = PatchExecutor::new(
        KubeResourceAccessor::new(client),
        configuration.allowed_prefixes.clone(),
        configuration.retry,
    );
    let scheduler = PollScheduler::new(
        provider,
        BatchDriver::new(executor),
        configuration.cluster.clone(),
        configuration.poll_interval,
    );
    let shutdown = CancellationToken::new();
    let mut scheduler = scheduler.start(shutdown.clone());
    info!("start controllers ...");
    let scheduler_done = tokio::select! {
        r = shutdown_signal() => {
            match r {
                Ok(_) => info!("received shutdown signal"),
                Err(e) => error!("failed to listen for shutdown signal: {}", e),
            }
            false
        }
        r = &mut scheduler => {
            if let Err(e) = r {
                error!("poll scheduler terminated unexpectedly: {}", e);
            }
            true
        }
    };
    // Let an in-flight batch complete before exiting.
    shutdown.cancel();
    if !scheduler_done {
        scheduler.await?;
    }
    prometheus_metrics_exporter.abort();
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    Ok(())
}
