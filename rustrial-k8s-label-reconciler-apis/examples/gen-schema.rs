use rustrial_k8s_label_reconciler_apis::GetResourcePatchesResponse;
use schemars::schema_for;
use serde_yaml;

pub fn main() {
    println!(
        "{}",
        serde_yaml::to_string(&schema_for!(GetResourcePatchesResponse)).unwrap()
    );
}
