pub(crate) fn metric_name(name: &str) -> String {
    format!("label_reconciler_{}", name)
}

/// Render a list of label keys for log messages.
pub(crate) fn join_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> String {
    keys.into_iter().collect::<Vec<&str>>().join(",")
}
