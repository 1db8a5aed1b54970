use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Affinity, PodAffinityTerm, PodAntiAffinity};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use kube::ResourceExt;

use crate::crd::DaemonJob;

pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

const RESTART_ALWAYS: &str = "Always";
const RESTART_ON_FAILURE: &str = "OnFailure";

/// Name of the Job managed on behalf of a DaemonJob.
pub fn job_name(daemon_job_name: &str) -> String {
    format!("{}-job", daemon_job_name)
}

/// Node labels a node must carry to run the DaemonJob. Empty means every node.
pub fn node_selector(daemon_job: &DaemonJob) -> BTreeMap<String, String> {
    daemon_job
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|spec| spec.node_selector.clone())
        .unwrap_or_default()
}

/// Builds the Job that runs the DaemonJob's template once per node.
///
/// `replicas` becomes both parallelism and completions. The pod template
/// gets a required anti-affinity on `{kind_label: request_name}` so the
/// scheduler never co-locates two of its pods, and an `Always` restart
/// policy is rewritten to `OnFailure`, which Jobs accept.
pub fn build_job(daemon_job: &DaemonJob, replicas: i32, request_name: &str, kind_label: &str) -> Job {
    let mut template = daemon_job.spec.template.clone();

    let mut pod_spec = template.spec.take().unwrap_or_default();
    pod_spec.affinity = Some(anti_affinity(request_name, kind_label));
    if pod_spec.restart_policy.as_deref() == Some(RESTART_ALWAYS) {
        pod_spec.restart_policy = Some(RESTART_ON_FAILURE.to_string());
    }
    template.spec = Some(pod_spec);

    // The anti-affinity term only matches pods that carry the label.
    let pod_meta = template.metadata.get_or_insert_with(Default::default);
    pod_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(kind_label.to_string(), request_name.to_string());

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(&daemon_job.name_any())),
            namespace: daemon_job.namespace(),
            labels: daemon_job.metadata.labels.clone(),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(replicas),
            completions: Some(replicas),
            selector: daemon_job.spec.selector.clone(),
            template,
            manual_selector: daemon_job.spec.manual_selector,
            ttl_seconds_after_finished: daemon_job.spec.ttl_seconds_after_finished,
            backoff_limit: daemon_job.spec.backoff_limit,
            active_deadline_seconds: daemon_job.spec.active_deadline_seconds,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn anti_affinity(request_name: &str, kind_label: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: kind_label.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![request_name.to_string()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Overwrites the converged fields of `current` with those of `desired`.
///
/// Spec and annotations are replaced wholesale, never merged.
pub fn converge_job(desired: &Job, current: &mut Job) {
    current.spec = desired.spec.clone();
    current.metadata.annotations = desired.metadata.annotations.clone();
}
