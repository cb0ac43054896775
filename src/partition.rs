use crate::model::{Job, Profile};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Jobs that target the same peer endpoint, executed back to back so the
/// shared underlay route is installed once and stays valid.
#[derive(Debug)]
pub struct EndpointGroup {
    pub endpoint_ip: Ipv4Addr,
    pub jobs: Vec<Job>,
}

/// One worker's serialized job queue, grouped by peer endpoint in
/// insertion order.
#[derive(Debug)]
pub struct WorkerBucket {
    pub worker_id: usize,
    pub groups: Vec<EndpointGroup>,
}

impl WorkerBucket {
    pub fn job_count(&self) -> usize {
        self.groups.iter().map(|group| group.jobs.len()).sum()
    }
}

/// Distributes profiles across workers. Profiles sharing a peer endpoint
/// or an interface address must not run concurrently: they are coalesced
/// onto whichever worker already holds the colliding profile, everything
/// else is spread round-robin. Buckets are scanned in ascending worker-id
/// order so the assignment is deterministic.
pub fn partition(profiles: Vec<Profile>, workers: usize) -> Vec<WorkerBucket> {
    let mut buckets: BTreeMap<usize, Vec<EndpointGroup>> = BTreeMap::new();
    for (index, profile) in profiles.into_iter().enumerate() {
        let target = find_endpoint_match(&buckets, profile.peer_endpoint_ip)
            .or_else(|| find_inner_match(&buckets, profile.inner_addr))
            .unwrap_or_else(|| index % workers + 1);
        append_job(buckets.entry(target).or_default(), Job { profile });
    }
    buckets
        .into_iter()
        .map(|(worker_id, groups)| WorkerBucket { worker_id, groups })
        .collect()
}

fn find_endpoint_match(
    buckets: &BTreeMap<usize, Vec<EndpointGroup>>,
    endpoint_ip: Ipv4Addr,
) -> Option<usize> {
    buckets
        .iter()
        .find(|(_, groups)| groups.iter().any(|group| group.endpoint_ip == endpoint_ip))
        .map(|(worker_id, _)| *worker_id)
}

fn find_inner_match(
    buckets: &BTreeMap<usize, Vec<EndpointGroup>>,
    inner_addr: Ipv4Addr,
) -> Option<usize> {
    buckets
        .iter()
        .find(|(_, groups)| {
            groups
                .iter()
                .any(|group| group.jobs.iter().any(|job| job.profile.inner_addr == inner_addr))
        })
        .map(|(worker_id, _)| *worker_id)
}

fn append_job(groups: &mut Vec<EndpointGroup>, job: Job) {
    let endpoint_ip = job.profile.peer_endpoint_ip;
    if let Some(group) = groups.iter_mut().find(|group| group.endpoint_ip == endpoint_ip) {
        group.jobs.push(job);
    } else {
        groups.push(EndpointGroup {
            endpoint_ip,
            jobs: vec![job],
        });
    }
}
