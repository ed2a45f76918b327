use crate::{
    errors::{ControllerError, ExtKubeApiError},
    label_diff::{compute_final_labels, needs_update, unowned_desired_keys},
    ownership::{AllowedPrefixSet, OwnershipMatcher},
    resource_accessor::ResourceAccessor,
    utils::{join_keys, metric_name},
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use rustrial_k8s_label_reconciler_apis::ResourcePatch;
use tokio::time::{Duration, sleep};

const PATCH_EXECUTOR: &'static str = "patch_executor";

/// Bounds the get-diff-update cycle of a single resource patch under write contention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Maximum number of update attempts, including the first one.
    pub attempts: u32,
    /// Pause between two attempts, zero retries immediately.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::ZERO,
        }
    }
}

/// Terminal state of a successfully processed resource patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    /// The object's labels were updated.
    Updated,
    /// The object's labels already matched the desired state.
    Unchanged,
    /// The object does not exist (anymore).
    Skipped,
}

impl ApplyOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Unchanged => "unchanged",
            ApplyOutcome::Skipped => "skipped",
        }
    }
}

/// Applies single [`ResourcePatch`]es with optimistic concurrency control.
pub(crate) struct PatchExecutor<A> {
    accessor: A,
    allowed_prefixes: AllowedPrefixSet,
    retry: RetryPolicy,
    apply_count: Counter<u64>,
    conflict_count: Counter<u64>,
}

impl<A: ResourceAccessor> PatchExecutor<A> {
    pub fn new(accessor: A, allowed_prefixes: AllowedPrefixSet, retry: RetryPolicy) -> Self {
        let meter: Meter = global::meter(PATCH_EXECUTOR);
        let apply_count = meter
            .u64_counter(metric_name("patch_apply_count"))
            .with_description("Count of applied resource patches by outcome")
            .build();
        let conflict_count = meter
            .u64_counter(metric_name("patch_conflict_count"))
            .with_description("Count of label updates rejected because of concurrent modifications")
            .build();
        Self {
            accessor,
            allowed_prefixes,
            retry,
            apply_count,
            conflict_count,
        }
    }

    #[cfg(test)]
    pub fn accessor(&self) -> &A {
        &self.accessor
    }

    /// Converge the owned labels of the patch's target object to the desired labels.
    ///
    /// The ownership patterns are validated against the allowed prefixes before the
    /// object is fetched, a rejected patch never reaches the target cluster.
    pub async fn apply(&self, patch: &ResourcePatch) -> Result<ApplyOutcome, ControllerError> {
        let result = self.try_apply(patch).await;
        let outcome = match &result {
            Ok(outcome) => outcome.as_str(),
            Err(ControllerError::RejectedOwnership(_)) => "rejected",
            Err(_) => "failed",
        };
        self.apply_count.add(
            1,
            &[
                KeyValue::new("outcome", outcome),
                KeyValue::new("resource", patch.gvr.resource.clone()),
            ],
        );
        result
    }

    async fn try_apply(&self, patch: &ResourcePatch) -> Result<ApplyOutcome, ControllerError> {
        self.allowed_prefixes.validate(&patch.owned_labels_regex)?;
        let owned = OwnershipMatcher::compile(&patch.owned_labels_regex)?;
        let ignored = join_keys(unowned_desired_keys(&patch.labels, &owned));
        if !ignored.is_empty() {
            warn!(
                "ignoring desired labels of {} not covered by its ownership: {}",
                patch.id(),
                ignored
            );
        }
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            // Always start from a freshly fetched object, never from the one of a failed attempt.
            let mut target = match self
                .accessor
                .get(&patch.gvr, patch.name.as_str(), patch.namespace())
                .await
            {
                Ok(target) => target,
                Err(e) if e.is_not_found() => {
                    info!("skipping {} as the object does not exist", patch.id());
                    return Ok(ApplyOutcome::Skipped);
                }
                Err(e) => return Err(e),
            };
            if !needs_update(target.labels(), &patch.labels, &owned) {
                debug!("labels of {} are up to date", target);
                return Ok(ApplyOutcome::Unchanged);
            }
            let labels = compute_final_labels(target.labels(), &patch.labels, &owned);
            target.set_labels(labels);
            let version = target.to_string();
            match self.accessor.update(target).await {
                Ok(updated) => {
                    info!("updated labels of {} (now {})", version, updated);
                    return Ok(ApplyOutcome::Updated);
                }
                Err(ControllerError::KubeApi(e)) if e.is_conflict() => {
                    self.conflict_count
                        .add(1, &[KeyValue::new("resource", patch.gvr.resource.clone())]);
                    if attempt >= attempts {
                        return Err(ControllerError::RetriesExhausted {
                            attempts,
                            source: e,
                        });
                    }
                    debug!(
                        "concurrent modification of {} (attempt {} of {}): {}",
                        version, attempt, attempts, e
                    );
                    if !self.retry.delay.is_zero() {
                        sleep(self.retry.delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
