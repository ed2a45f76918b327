use crate::{
    errors::ControllerError,
    patch_executor::{ApplyOutcome, PatchExecutor},
    resource_accessor::ResourceAccessor,
};
use rustrial_k8s_label_reconciler_apis::ResourcePatch;

/// A resource patch which could not be applied.
#[derive(Debug)]
pub(crate) struct PatchFailure {
    pub id: String,
    pub error: ControllerError,
}

/// Summary of a single pass over a batch of resource patches.
#[derive(Debug, Default)]
pub(crate) struct BatchResult {
    pub attempted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failures: Vec<PatchFailure>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn the result into an aggregate error if any patch failed.
    pub fn into_result(self) -> Result<BatchResult, ControllerError> {
        if self.all_succeeded() {
            Ok(self)
        } else {
            let details: Vec<String> = self
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.id, f.error))
                .collect();
            Err(ControllerError::BatchFailed {
                failed: self.failures.len(),
                attempted: self.attempted,
                details: details.join("; "),
            })
        }
    }
}

impl std::fmt::Display for BatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} resource patches: {} updated, {} unchanged, {} skipped, {} failed",
            self.attempted,
            self.updated,
            self.unchanged,
            self.skipped,
            self.failures.len()
        )
    }
}

/// Applies batches of independent resource patches one after the other.
pub(crate) struct BatchDriver<A> {
    executor: PatchExecutor<A>,
}

impl<A: ResourceAccessor> BatchDriver<A> {
    pub fn new(executor: PatchExecutor<A>) -> Self {
        Self { executor }
    }

    #[cfg(test)]
    pub fn executor(&self) -> &PatchExecutor<A> {
        &self.executor
    }

    /// Apply all patches in the order received. A failing patch does not stop
    /// the remaining ones from being applied.
    pub async fn apply_batch(&self, patches: &[ResourcePatch]) -> BatchResult {
        let mut result = BatchResult::default();
        for patch in patches {
            result.attempted += 1;
            match self.executor.apply(patch).await {
                Ok(ApplyOutcome::Updated) => result.updated += 1,
                Ok(ApplyOutcome::Unchanged) => result.unchanged += 1,
                Ok(ApplyOutcome::Skipped) => result.skipped += 1,
                Err(error) => {
                    if error.is_temporary() {
                        error!("failed to apply resource patch {}: {}", patch.id(), error);
                    } else {
                        error!(
                            "rejected resource patch {} permanently: {}",
                            patch.id(),
                            error
                        );
                    }
                    result.failures.push(PatchFailure {
                        id: patch.id(),
                        error,
                    });
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ownership::AllowedPrefixSet,
        patch_executor::RetryPolicy,
        testing::{MockAccessor, labels, node, patch},
    };
    use std::sync::atomic::Ordering;

    fn driver(accessor: MockAccessor) -> BatchDriver<MockAccessor> {
        BatchDriver::new(PatchExecutor::new(
            accessor,
            AllowedPrefixSet::parse("pool.intel.com"),
            RetryPolicy::default(),
        ))
    }

    #[tokio::test]
    async fn empty_batch() {
        let result = driver(MockAccessor::default()).apply_batch(&[]).await;
        assert_eq!(0, result.attempted);
        assert!(result.all_succeeded());
        assert!(result.into_result().is_ok());
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let accessor = MockAccessor::default();
        for name in ["node-1", "node-2", "node-3", "node-4"] {
            accessor.insert(node(name, &[("env", "prod")], "1"));
        }
        accessor.get_errors.lock().unwrap().insert("node-2".to_string(), 500);
        let driver = driver(accessor);
        let desired = &[("pool.intel.com/general", "true")];
        let owned = &["pool.intel.com/.*"];
        let patches = vec![
            patch("node-1", desired, owned),
            patch("node-2", desired, owned),
            patch("node-3", desired, &["billing.intel.com/.*"]),
            patch("node-4", desired, owned),
            patch("node-5", desired, owned),
        ];
        let result = driver.apply_batch(&patches).await;
        assert_eq!(5, result.attempted);
        assert_eq!(2, result.updated);
        assert_eq!(1, result.skipped);
        assert_eq!(
            vec!["/v1/nodes:/node-2", "/v1/nodes:/node-3"],
            result.failures.iter().map(|f| f.id.as_str()).collect::<Vec<_>>()
        );
        assert!(!result.all_succeeded());
        let accessor = driver.executor().accessor();
        for name in ["node-1", "node-4"] {
            assert_eq!(
                labels(&[("env", "prod"), ("pool.intel.com/general", "true")]),
                accessor.labels_of(name).unwrap()
            );
        }
        for name in ["node-2", "node-3"] {
            assert_eq!(labels(&[("env", "prod")]), accessor.labels_of(name).unwrap());
        }
        assert_eq!(2, accessor.updates.load(Ordering::SeqCst));
        match result.into_result() {
            Err(ControllerError::BatchFailed {
                failed, attempted, ..
            }) => {
                assert_eq!(2, failed);
                assert_eq!(5, attempted);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn summary() {
        let accessor = MockAccessor::default();
        accessor.insert(node("node-1", &[("pool.intel.com/general", "true")], "1"));
        let driver = driver(accessor);
        let result = driver
            .apply_batch(&[patch(
                "node-1",
                &[("pool.intel.com/general", "true")],
                &["pool.intel.com/.*"],
            )])
            .await;
        assert_eq!(
            "1 resource patches: 0 updated, 1 unchanged, 0 skipped, 0 failed",
            result.to_string()
        );
    }
}
