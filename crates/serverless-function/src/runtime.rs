//! Per-runtime build and run settings

use k8s_openapi::api::core::v1::EnvVar;

use serverless_common::crd::Runtime;

/// Settings that differ between runtimes
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    /// Runtime these settings belong to
    pub runtime: Runtime,
    /// File the inline source is written to
    pub function_file: &'static str,
    /// File the inline dependencies are written to
    pub dependency_file: &'static str,
    /// ConfigMap holding the runtime Dockerfile
    pub dockerfile_config_map: String,
    /// Package registry config file mounted into builds
    pub package_config_file: &'static str,
    /// Extra env for function containers
    pub envs: Vec<EnvVar>,
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Settings for `runtime`
pub fn runtime_config(runtime: Runtime) -> RuntimeConfig {
    let dockerfile_config_map = format!("dockerfile-{runtime}");
    match runtime {
        Runtime::NodeJs16 | Runtime::NodeJs18 => RuntimeConfig {
            runtime,
            function_file: "handler.js",
            dependency_file: "package.json",
            dockerfile_config_map,
            package_config_file: ".npmrc",
            envs: vec![
                env("NODE_PATH", "$(KUBELESS_INSTALL_VOLUME)/node_modules"),
                env("FUNC_RUNTIME", &runtime.to_string()),
            ],
        },
        Runtime::Python39 => RuntimeConfig {
            runtime,
            function_file: "handler.py",
            dependency_file: "requirements.txt",
            dockerfile_config_map,
            package_config_file: "pip.conf",
            envs: vec![
                env(
                    "PYTHONPATH",
                    "$(KUBELESS_INSTALL_VOLUME)/lib.python3.9/site-packages:$(KUBELESS_INSTALL_VOLUME)",
                ),
                env("FUNC_RUNTIME", "python39"),
                env("PYTHONUNBUFFERED", "TRUE"),
            ],
        },
    }
}

/// Normalize a dependency manifest so that the stored and expected forms compare equal
///
/// An empty `package.json` breaks `npm install`, so Node.js runtimes get `{}`.
pub fn sanitize_dependencies(runtime: Runtime, dependencies: &str) -> String {
    if runtime.is_nodejs() && dependencies.trim().is_empty() {
        return "{}".to_string();
    }
    dependencies.to_string()
}
