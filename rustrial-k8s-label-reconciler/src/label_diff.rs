//! Label reconciliation restricted to the label keys owned by a resource patch.
//!
//! Desired labels whose key is not matched by any ownership pattern are ignored,
//! so labels outside of the ownership boundary are never added, changed or removed.

use crate::ownership::OwnershipMatcher;
use std::collections::BTreeMap;

pub(crate) type Labels = BTreeMap<String, String>;

/// Check whether `current` has to be updated to converge to the owned subset of `desired`.
pub(crate) fn needs_update(current: &Labels, desired: &Labels, owned: &OwnershipMatcher) -> bool {
    let add_or_change = desired
        .iter()
        .filter(|(k, _)| owned.is_owned(k))
        .any(|(k, v)| current.get(k) != Some(v));
    add_or_change
        || current
            .keys()
            .any(|k| owned.is_owned(k) && !desired.contains_key(k))
}

/// Compute the labels `current` should have after applying `desired`.
///
/// Owned labels not present in `desired` are removed, owned `desired` labels are
/// written and all other labels are copied verbatim.
pub(crate) fn compute_final_labels(
    current: &Labels,
    desired: &Labels,
    owned: &OwnershipMatcher,
) -> Labels {
    let mut labels: Labels = current
        .iter()
        .filter(|(k, _)| !owned.is_owned(k) || desired.contains_key(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in desired.iter().filter(|(k, _)| owned.is_owned(k)) {
        labels.insert(k.clone(), v.clone());
    }
    labels
}

/// Desired label keys which are ignored because they are not owned.
pub(crate) fn unowned_desired_keys<'a>(
    desired: &'a Labels,
    owned: &'a OwnershipMatcher,
) -> impl Iterator<Item = &'a str> + 'a {
    desired
        .keys()
        .filter(move |k| !owned.is_owned(k))
        .map(|k| k.as_str())
}
