//! In-memory cluster used by stage and controller tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;

use serverless_common::crd::{Function, FunctionStatus};
use serverless_common::Error;

use crate::client::KubeClient;
use crate::controller::Context;
use crate::snapshot::tests::docker;
use crate::snapshot::SystemState;
use crate::stats::PhaseStatsCollector;

#[derive(Default)]
struct Store {
    functions: Vec<Function>,
    secrets: Vec<Secret>,
    config_maps: Vec<ConfigMap>,
    jobs: Vec<Job>,
    deployments: Vec<Deployment>,
    services: Vec<Service>,
    hpas: Vec<HorizontalPodAutoscaler>,
}

/// Cluster holding one Function and the objects the stages write
#[derive(Default)]
pub(crate) struct FakeCluster {
    store: Mutex<Store>,
    names: AtomicUsize,
    writes: AtomicUsize,
    status_writes: AtomicUsize,
    vanish_on_status_write: AtomicBool,
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{kind} \"{name}\" not found"),
            reason: "NotFound".to_string(),
            code: 404,
        }),
    }
}

fn selected<K: Resource>(obj: &K, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
    if namespace.is_some_and(|ns| obj.meta().namespace.as_deref() != Some(ns)) {
        return false;
    }
    let have = obj.meta().labels.clone().unwrap_or_default();
    labels.iter().all(|(k, v)| have.get(k) == Some(v))
}

fn list_in<K: Resource + Clone>(
    objs: &[K],
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Vec<K> {
    objs.iter()
        .filter(|o| selected(*o, namespace, labels))
        .cloned()
        .collect()
}

fn replace_in<K: Resource + Clone>(objs: &mut [K], obj: &K) -> Result<(), Error> {
    let slot = objs
        .iter_mut()
        .find(|o| o.meta().name == obj.meta().name && o.meta().namespace == obj.meta().namespace)
        .ok_or_else(|| not_found("object", &obj.meta().name.clone().unwrap_or_default()))?;
    *slot = obj.clone();
    Ok(())
}

impl FakeCluster {
    /// Cluster with `function` and the default registry Secret in its namespace
    pub(crate) fn with_function(function: Function) -> Self {
        let namespace = function.namespace().unwrap_or_default();
        let registry = docker();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(registry.active_secret.clone()),
                namespace: Some(namespace),
                ..Default::default()
            },
            data: Some(
                [
                    ("registryAddress", registry.push_address.as_str()),
                    ("serverAddress", registry.pull_address.as_str()),
                    ("isInternal", "true"),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
            ),
            ..Default::default()
        };
        let cluster = Self::default();
        {
            let mut store = cluster.store.lock();
            store.functions.push(function);
            store.secrets.push(secret);
        }
        cluster
    }

    fn function(&self) -> Function {
        self.store.lock().functions[0].clone()
    }

    /// Snapshot of the stored Function as the reconciler would load it
    pub(crate) async fn snapshot(&self) -> SystemState {
        SystemState::load(self, self.function(), docker())
            .await
            .unwrap()
    }

    /// Number of writes of any kind
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of status subresource writes
    pub(crate) fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn function_status(&self) -> Option<FunctionStatus> {
        self.store.lock().functions.first().and_then(|f| f.status.clone())
    }

    pub(crate) fn config_maps(&self) -> Vec<ConfigMap> {
        self.store.lock().config_maps.clone()
    }

    pub(crate) fn jobs(&self) -> Vec<Job> {
        self.store.lock().jobs.clone()
    }

    pub(crate) fn deployments(&self) -> Vec<Deployment> {
        self.store.lock().deployments.clone()
    }

    pub(crate) fn services(&self) -> Vec<Service> {
        self.store.lock().services.clone()
    }

    pub(crate) fn hpas(&self) -> Vec<HorizontalPodAutoscaler> {
        self.store.lock().hpas.clone()
    }

    /// Edit the Function spec; the generation is bumped like the API server does
    pub(crate) fn edit_function(&self, edit: impl FnOnce(&mut Function)) {
        let mut store = self.store.lock();
        let function = &mut store.functions[0];
        edit(function);
        function.metadata.generation = Some(function.metadata.generation.unwrap_or(1) + 1);
    }

    /// Mark the Function as being deleted
    pub(crate) fn delete_function(&self) {
        let mut store = self.store.lock();
        store.functions[0].metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    }

    /// The Function disappears as soon as its status is written
    pub(crate) fn vanish_on_status_write(&self) {
        self.vanish_on_status_write.store(true, Ordering::SeqCst);
    }

    /// Every Job, Service and autoscaler is a copy of the one already there
    pub(crate) fn duplicate_owned(&self) {
        let (jobs, services, hpas) = {
            let store = self.store.lock();
            (store.jobs.clone(), store.services.clone(), store.hpas.clone())
        };
        let unnamed = |meta: &mut ObjectMeta| {
            meta.name = None;
            meta.resource_version = None;
        };
        for mut job in jobs {
            unnamed(&mut job.metadata);
            self.insert_job(job);
        }
        for mut service in services {
            unnamed(&mut service.metadata);
            service.metadata.generate_name = Some("copy-".to_string());
            self.insert_service(service);
        }
        for mut hpa in hpas {
            unnamed(&mut hpa.metadata);
            self.insert_hpa(hpa);
        }
    }

    pub(crate) fn edit_deployments(&self, edit: impl Fn(&mut Deployment)) {
        self.store.lock().deployments.iter_mut().for_each(edit);
    }

    pub(crate) fn edit_services(&self, edit: impl Fn(&mut Service)) {
        self.store.lock().services.iter_mut().for_each(edit);
    }

    pub(crate) fn insert_config_map(&self, cm: ConfigMap) {
        let cm = self.named(cm);
        self.store.lock().config_maps.push(cm);
    }

    pub(crate) fn insert_job(&self, job: Job) {
        let job = self.named(job);
        self.store.lock().jobs.push(job);
    }

    pub(crate) fn insert_deployment(&self, deployment: Deployment) {
        let deployment = self.named(deployment);
        self.store.lock().deployments.push(deployment);
    }

    pub(crate) fn insert_service(&self, service: Service) {
        let service = self.named(service);
        self.store.lock().services.push(service);
    }

    pub(crate) fn insert_hpa(&self, hpa: HorizontalPodAutoscaler) {
        let hpa = self.named(hpa);
        self.store.lock().hpas.push(hpa);
    }

    /// Every build Job reports a succeeded Pod and a completion time
    pub(crate) fn complete_jobs(&self) {
        for job in self.store.lock().jobs.iter_mut() {
            job.status = Some(JobStatus {
                succeeded: Some(1),
                completion_time: Some(Time(chrono::Utc::now())),
                ..Default::default()
            });
        }
    }

    /// Every build Job carries a `Failed` condition with `reason`
    pub(crate) fn fail_jobs(&self, reason: &str) {
        for job in self.store.lock().jobs.iter_mut() {
            job.status = Some(JobStatus {
                failed: Some(1),
                conditions: Some(vec![JobCondition {
                    type_: "Failed".to_string(),
                    status: "True".to_string(),
                    reason: Some(reason.to_string()),
                    message: Some("Job has reached the specified backoff limit".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    /// Replace the conditions of every Deployment with `(type, status, reason)`
    pub(crate) fn set_deployment_conditions(&self, conditions: &[(&str, &str, &str)]) {
        let conditions: Vec<_> = conditions
            .iter()
            .map(|(type_, status, reason)| DeploymentCondition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: Some(reason.to_string()),
                ..Default::default()
            })
            .collect();
        for deployment in self.store.lock().deployments.iter_mut() {
            deployment.status = Some(DeploymentStatus {
                conditions: Some(conditions.clone()),
                ..Default::default()
            });
        }
    }

    /// Assign a name from `generateName` like the API server does
    fn named<K: Resource + Clone>(&self, obj: K) -> K {
        let mut obj = obj;
        if obj.meta().name.is_none() {
            let n = self.names.fetch_add(1, Ordering::SeqCst);
            let prefix = obj.meta().generate_name.clone().unwrap_or_default();
            obj.meta_mut().name = Some(format!("{prefix}{n:05}"));
        }
        if obj.meta().namespace.is_none() {
            obj.meta_mut().namespace = self.store.lock().functions[0].namespace();
        }
        obj
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KubeClient for FakeCluster {
    async fn get_function(&self, namespace: &str, name: &str) -> Result<Option<Function>, Error> {
        Ok(self
            .store
            .lock()
            .functions
            .iter()
            .find(|f| f.name_any() == name && f.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn patch_function_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FunctionStatus,
    ) -> Result<(), Error> {
        self.write();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock();
        if self.vanish_on_status_write.load(Ordering::SeqCst) {
            store.functions.clear();
        }
        let function = store
            .functions
            .iter_mut()
            .find(|f| f.name_any() == name && f.namespace().as_deref() == Some(namespace))
            .ok_or_else(|| not_found("functions", name))?;
        function.status = Some(status.clone());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self
            .store
            .lock()
            .secrets
            .iter()
            .find(|s| s.name_any() == name && s.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>, Error> {
        Ok(list_in(&self.store.lock().config_maps, Some(namespace), labels))
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error> {
        Ok(list_in(&self.store.lock().jobs, Some(namespace), labels))
    }

    async fn list_jobs_all_namespaces(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error> {
        Ok(list_in(&self.store.lock().jobs, None, labels))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, Error> {
        Ok(list_in(&self.store.lock().deployments, Some(namespace), labels))
    }

    async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>, Error> {
        Ok(list_in(&self.store.lock().services, Some(namespace), labels))
    }

    async fn list_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
        Ok(list_in(&self.store.lock().hpas, Some(namespace), labels))
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        self.write();
        let cm = self.named(cm.clone());
        self.store.lock().config_maps.push(cm.clone());
        Ok(cm)
    }

    async fn create_job(&self, job: &Job) -> Result<Job, Error> {
        self.write();
        let job = self.named(job.clone());
        self.store.lock().jobs.push(job.clone());
        Ok(job)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        self.write();
        let deployment = self.named(deployment.clone());
        self.store.lock().deployments.push(deployment.clone());
        Ok(deployment)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        self.write();
        let service = self.named(service.clone());
        self.store.lock().services.push(service.clone());
        Ok(service)
    }

    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        self.write();
        let hpa = self.named(hpa.clone());
        self.store.lock().hpas.push(hpa.clone());
        Ok(hpa)
    }

    async fn update_config_map(&self, cm: &ConfigMap) -> Result<(), Error> {
        self.write();
        replace_in(&mut self.store.lock().config_maps, cm)
    }

    async fn update_job(&self, job: &Job) -> Result<(), Error> {
        self.write();
        replace_in(&mut self.store.lock().jobs, job)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.write();
        replace_in(&mut self.store.lock().deployments, deployment)
    }

    async fn update_service(&self, service: &Service) -> Result<(), Error> {
        self.write();
        replace_in(&mut self.store.lock().services, service)
    }

    async fn update_hpa(&self, hpa: &HorizontalPodAutoscaler) -> Result<(), Error> {
        self.write();
        replace_in(&mut self.store.lock().hpas, hpa)
    }

    async fn delete_all_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.write();
        self.store
            .lock()
            .config_maps
            .retain(|o| !selected(o, Some(namespace), labels));
        Ok(())
    }

    async fn delete_all_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.write();
        self.store
            .lock()
            .jobs
            .retain(|o| !selected(o, Some(namespace), labels));
        Ok(())
    }

    async fn delete_all_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.write();
        self.store
            .lock()
            .deployments
            .retain(|o| !selected(o, Some(namespace), labels));
        Ok(())
    }

    async fn delete_all_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.write();
        self.store
            .lock()
            .hpas
            .retain(|o| !selected(o, Some(namespace), labels));
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.write();
        self.store
            .lock()
            .services
            .retain(|s| !(s.name_any() == name && s.namespace().as_deref() == Some(namespace)));
        Ok(())
    }
}

/// Context over `cluster` with a real stats collector and default settings
pub(crate) fn ctx_with(cluster: Arc<FakeCluster>) -> Context {
    Context::for_testing(cluster, Arc::new(PhaseStatsCollector::new()))
}
