//! Inline sources ConfigMap

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;

use crate::runtime::sanitize_dependencies;
use crate::snapshot::SystemState;

/// Data key holding the function source
pub const FUNCTION_SOURCE_KEY: &str = "source";

/// Data key holding the dependency manifest
pub const FUNCTION_DEPS_KEY: &str = "dependencies";

/// ConfigMap carrying the inline source and sanitized dependencies
pub fn build_config_map(state: &SystemState) -> ConfigMap {
    let spec = &state.function.spec;
    let (source, dependencies) = spec
        .source
        .inline
        .as_ref()
        .map(|i| (i.source.clone(), i.dependencies.clone()))
        .unwrap_or_default();

    ConfigMap {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", state.name)),
            namespace: Some(state.namespace.clone()),
            labels: Some(state.function_labels()),
            owner_references: state.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (FUNCTION_SOURCE_KEY.to_string(), source),
            (
                FUNCTION_DEPS_KEY.to_string(),
                sanitize_dependencies(spec.runtime, &dependencies),
            ),
        ])),
        ..Default::default()
    }
}
