//! Kubernetes access for the Function reconciler
//!
//! Every read and write the stages perform goes through [`KubeClient`] so the
//! reconciler can run against an in-memory cluster in tests. Listing is always
//! by label set; the only cluster-wide call is the build Job listing used by
//! the admission gate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use serverless_common::crd::{Function, FunctionStatus};
use serverless_common::labels::label_selector;
use serverless_common::Error;

/// Operations the reconciler performs against the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Function, `None` when it no longer exists
    async fn get_function(&self, namespace: &str, name: &str) -> Result<Option<Function>, Error>;

    /// Replace the status subresource of a Function
    async fn patch_function_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FunctionStatus,
    ) -> Result<(), Error>;

    /// Get a Secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// List ConfigMaps carrying all `labels`
    async fn list_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>, Error>;

    /// List Jobs carrying all `labels`
    async fn list_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error>;

    /// List Jobs carrying all `labels` in every namespace
    async fn list_jobs_all_namespaces(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error>;

    /// List Deployments carrying all `labels`
    async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, Error>;

    /// List Services carrying all `labels`
    async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>, Error>;

    /// List HorizontalPodAutoscalers carrying all `labels`
    async fn list_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, Error>;

    /// Create a Job
    async fn create_job(&self, job: &Job) -> Result<Job, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Create a HorizontalPodAutoscaler
    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error>;

    /// Replace a ConfigMap
    async fn update_config_map(&self, cm: &ConfigMap) -> Result<(), Error>;

    /// Replace a Job (labels only; the spec is immutable)
    async fn update_job(&self, job: &Job) -> Result<(), Error>;

    /// Replace a Deployment
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Replace a Service
    async fn update_service(&self, service: &Service) -> Result<(), Error>;

    /// Replace a HorizontalPodAutoscaler
    async fn update_hpa(&self, hpa: &HorizontalPodAutoscaler) -> Result<(), Error>;

    /// Delete every ConfigMap carrying all `labels`
    async fn delete_all_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete every Job carrying all `labels`, with their Pods
    async fn delete_all_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete every Deployment carrying all `labels`
    async fn delete_all_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete every HorizontalPodAutoscaler carrying all `labels`
    async fn delete_all_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete one Service by name
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`KubeClient`] backed by a real API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn selected(labels: &BTreeMap<String, String>) -> ListParams {
    ListParams::default().labels(&label_selector(labels))
}

async fn list<K>(api: Api<K>, labels: &BTreeMap<String, String>) -> Result<Vec<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api.list(&selected(labels)).await?.items)
}

async fn replace<K>(api: Api<K>, obj: &K) -> Result<(), Error>
where
    K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    api.replace(&obj.name_any(), &PostParams::default(), obj)
        .await?;
    Ok(())
}

async fn delete_collection<K>(api: Api<K>, labels: &BTreeMap<String, String>) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    api.delete_collection(&DeleteParams::background(), &selected(labels))
        .await?;
    Ok(())
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_function(&self, namespace: &str, name: &str) -> Result<Option<Function>, Error> {
        Ok(self.api::<Function>(namespace).get_opt(name).await?)
    }

    async fn patch_function_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FunctionStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api::<Function>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.api::<Secret>(namespace).get_opt(name).await?)
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ConfigMap>, Error> {
        list(self.api(namespace), labels).await
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error> {
        list(self.api(namespace), labels).await
    }

    async fn list_jobs_all_namespaces(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Job>, Error> {
        list(Api::all(self.client.clone()), labels).await
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>, Error> {
        list(self.api(namespace), labels).await
    }

    async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>, Error> {
        list(self.api(namespace), labels).await
    }

    async fn list_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<HorizontalPodAutoscaler>, Error> {
        list(self.api(namespace), labels).await
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        let ns = cm.namespace().unwrap_or_default();
        Ok(self.api(&ns).create(&PostParams::default(), cm).await?)
    }

    async fn create_job(&self, job: &Job) -> Result<Job, Error> {
        let ns = job.namespace().unwrap_or_default();
        Ok(self.api(&ns).create(&PostParams::default(), job).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let ns = deployment.namespace().unwrap_or_default();
        Ok(self.api(&ns).create(&PostParams::default(), deployment).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let ns = service.namespace().unwrap_or_default();
        Ok(self.api(&ns).create(&PostParams::default(), service).await?)
    }

    async fn create_hpa(
        &self,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, Error> {
        let ns = hpa.namespace().unwrap_or_default();
        Ok(self.api(&ns).create(&PostParams::default(), hpa).await?)
    }

    async fn update_config_map(&self, cm: &ConfigMap) -> Result<(), Error> {
        replace(self.api(&cm.namespace().unwrap_or_default()), cm).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), Error> {
        replace(self.api(&job.namespace().unwrap_or_default()), job).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        replace(self.api(&deployment.namespace().unwrap_or_default()), deployment).await
    }

    async fn update_service(&self, service: &Service) -> Result<(), Error> {
        replace(self.api(&service.namespace().unwrap_or_default()), service).await
    }

    async fn update_hpa(&self, hpa: &HorizontalPodAutoscaler) -> Result<(), Error> {
        replace(self.api(&hpa.namespace().unwrap_or_default()), hpa).await
    }

    async fn delete_all_config_maps(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        delete_collection(self.api::<ConfigMap>(namespace), labels).await
    }

    async fn delete_all_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        delete_collection(self.api::<Job>(namespace), labels).await
    }

    async fn delete_all_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        delete_collection(self.api::<Deployment>(namespace), labels).await
    }

    async fn delete_all_hpas(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        delete_collection(self.api::<HorizontalPodAutoscaler>(namespace), labels).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<Service>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
