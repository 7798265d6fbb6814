//! Function autoscaler

use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use kube::api::ObjectMeta;

use crate::config::FunctionConfig;
use crate::snapshot::SystemState;

/// Expected autoscaler targeting the Deployment named `deployment_name`
pub fn build_hpa(
    state: &SystemState,
    config: &FunctionConfig,
    deployment_name: &str,
) -> HorizontalPodAutoscaler {
    let (min, max) = state.function.spec.replica_bounds();
    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", state.name)),
            namespace: Some(state.namespace.clone()),
            labels: Some(state.function_labels()),
            owner_references: state.owner_reference().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: deployment_name.to_string(),
            },
            min_replicas: Some(min),
            max_replicas: max,
            target_cpu_utilization_percentage: Some(config.target_cpu_utilization_percentage),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::{inline_function, state};
    use serverless_common::crd::ScaleConfig;

    #[test]
    fn autoscaler_uses_resolved_bounds() {
        let mut function = inline_function("hello");
        function.spec.scale_config = Some(ScaleConfig {
            min_replicas: Some(2),
            max_replicas: Some(6),
        });
        let hpa = build_hpa(&state(function), &FunctionConfig::default(), "hello-abcde");
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 6);
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.scale_target_ref.name, "hello-abcde");
        assert_eq!(spec.target_cpu_utilization_percentage, Some(50));
    }
}
