//! Build admission gate
//!
//! Caps the number of build Jobs running at once across the cluster. The
//! count is re-read from the API server on every check and nothing is held
//! between the check and the Job creation, so concurrent passes for
//! different Functions can both be admitted and overshoot the cap by the
//! number of checks racing at that moment. The cap is approximate.

use k8s_openapi::api::batch::v1::Job;
use tracing::debug;

use serverless_common::labels::managed_by_labels;
use serverless_common::metrics::set_active_build_jobs;
use serverless_common::Error;

use crate::client::KubeClient;

/// Jobs that have neither failed nor succeeded
pub fn count_active(jobs: &[Job]) -> usize {
    jobs.iter()
        .filter(|job| {
            let status = job.status.as_ref();
            status.and_then(|s| s.failed).unwrap_or(0) == 0
                && status.and_then(|s| s.succeeded).unwrap_or(0) == 0
        })
        .count()
}

/// Admission check against a live cluster-wide Job listing
#[derive(Clone, Copy, Debug)]
pub struct BuildGate {
    max_simultaneous_jobs: usize,
}

impl BuildGate {
    /// Gate admitting at most `max_simultaneous_jobs` active builds
    pub fn new(max_simultaneous_jobs: usize) -> Self {
        Self {
            max_simultaneous_jobs,
        }
    }

    /// True when another build may start now
    pub async fn admit(&self, client: &dyn KubeClient) -> Result<bool, Error> {
        let jobs = client.list_jobs_all_namespaces(&managed_by_labels()).await?;
        let active = count_active(&jobs);
        set_active_build_jobs(active);
        debug!(active, max = self.max_simultaneous_jobs, "build admission check");
        Ok(active < self.max_simultaneous_jobs)
    }
}
