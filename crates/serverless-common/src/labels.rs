//! Reserved label keys and label-set helpers
//!
//! The internal label set identifies every object owned by a Function and is
//! used both as the list selector and as an anti-tamper guard: user labels
//! can never override a reserved key.

use std::collections::BTreeMap;

use tracing::debug;

/// Label carrying the owning Function's name
pub const FUNCTION_NAME_LABEL: &str = "serverless.kyma-project.io/function-name";

/// Label marking objects managed by this controller
pub const FUNCTION_MANAGED_BY_LABEL: &str = "serverless.kyma-project.io/managed-by";

/// Label carrying the owning Function's UID
pub const FUNCTION_UUID_LABEL: &str = "serverless.kyma-project.io/uuid";

/// Label distinguishing the pod selector of the function Deployment
pub const FUNCTION_RESOURCE_LABEL: &str = "serverless.kyma-project.io/resource";

/// Value of [`FUNCTION_MANAGED_BY_LABEL`]
pub const FUNCTION_CONTROLLER_VALUE: &str = "function-controller";

/// Value of [`FUNCTION_RESOURCE_LABEL`] on Deployment pods
pub const FUNCTION_RESOURCE_DEPLOYMENT_VALUE: &str = "deployment";

/// Keys that only the controller may set
pub const RESERVED_LABEL_KEYS: [&str; 4] = [
    FUNCTION_NAME_LABEL,
    FUNCTION_MANAGED_BY_LABEL,
    FUNCTION_UUID_LABEL,
    FUNCTION_RESOURCE_LABEL,
];

/// Returns true if the key is owned by the controller
pub fn is_reserved(key: &str) -> bool {
    RESERVED_LABEL_KEYS.contains(&key)
}

/// Internal labels identifying objects owned by one Function
pub fn internal_function_labels(name: &str, uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (FUNCTION_NAME_LABEL.to_string(), name.to_string()),
        (
            FUNCTION_MANAGED_BY_LABEL.to_string(),
            FUNCTION_CONTROLLER_VALUE.to_string(),
        ),
        (FUNCTION_UUID_LABEL.to_string(), uid.to_string()),
    ])
}

/// Labels marking every build Job of this controller, across all namespaces
pub fn managed_by_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        FUNCTION_MANAGED_BY_LABEL.to_string(),
        FUNCTION_CONTROLLER_VALUE.to_string(),
    )])
}

/// Merge user labels with controller labels.
///
/// User entries with reserved keys are dropped; controller entries always win.
pub fn merge_labels(
    user: Option<&BTreeMap<String, String>>,
    internal: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (key, value) in user.into_iter().flatten() {
        if is_reserved(key) {
            debug!(label = %key, "ignoring user label with reserved key");
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged.extend(internal);
    merged
}

/// Render a label map as a Kubernetes equality selector (`k1=v1,k2=v2`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_labels_identify_function() {
        let labels = internal_function_labels("hello", "uid-1");
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[FUNCTION_NAME_LABEL], "hello");
        assert_eq!(labels[FUNCTION_MANAGED_BY_LABEL], "function-controller");
        assert_eq!(labels[FUNCTION_UUID_LABEL], "uid-1");
    }

    #[test]
    fn reserved_keys_cannot_be_overridden() {
        let user = BTreeMap::from([
            (FUNCTION_UUID_LABEL.to_string(), "forged".to_string()),
            ("team".to_string(), "payments".to_string()),
        ]);
        let merged = merge_labels(Some(&user), internal_function_labels("hello", "uid-1"));

        assert_eq!(merged[FUNCTION_UUID_LABEL], "uid-1");
        assert_eq!(merged["team"], "payments");
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn reserved_resource_key_from_user_is_dropped() {
        let user = BTreeMap::from([(FUNCTION_RESOURCE_LABEL.to_string(), "job".to_string())]);
        let merged = merge_labels(Some(&user), internal_function_labels("hello", "uid-1"));
        assert!(!merged.contains_key(FUNCTION_RESOURCE_LABEL));
    }

    #[test]
    fn merge_without_user_labels() {
        let merged = merge_labels(None, internal_function_labels("hello", "uid-1"));
        assert_eq!(merged, internal_function_labels("hello", "uid-1"));
    }

    #[test]
    fn selector_is_sorted_and_comma_separated() {
        let selector = label_selector(&BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]));
        assert_eq!(selector, "a=1,b=2");
    }
}
