use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Prefix for every tunnel interface this tool creates.
pub const INTERFACE_PREFIX: &str = "wg_";

/// Linux caps interface names at 15 visible characters (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME: usize = 15;

/// Policy routing tables are keyed at `sequence + TABLE_OFFSET` to stay
/// clear of the reserved kernel tables.
pub const TABLE_OFFSET: u32 = 1000;

/// One WireGuard client profile, immutable after load.
#[derive(Clone, Debug)]
pub struct Profile {
    pub id: String,
    /// 1-based load ordinal; keys the fwmark and the policy table.
    pub sequence: u32,
    pub inner_addr: Ipv4Addr,
    pub dns_servers: Vec<String>,
    pub private_key_hex: String,
    pub peer_allowed_ips: Vec<String>,
    pub peer_endpoint_ip: Ipv4Addr,
    pub peer_endpoint_port: u16,
    pub peer_public_key_hex: String,
}

impl Profile {
    pub fn interface_name(&self) -> String {
        format!("{}{}", INTERFACE_PREFIX, self.id)
    }

    pub fn table_id(&self) -> u32 {
        self.sequence + TABLE_OFFSET
    }

    pub fn fwmark(&self) -> u32 {
        self.sequence
    }
}

pub fn interface_name_fits(id: &str) -> bool {
    INTERFACE_PREFIX.len() + id.len() <= MAX_INTERFACE_NAME
}

/// One unit of work for a worker; wraps exactly one profile.
#[derive(Clone, Debug)]
pub struct Job {
    pub profile: Profile,
}

/// Terminal report for one job: a success message or an error string.
#[derive(Debug)]
pub struct JobOutcome {
    pub profile_id: String,
    pub result: Result<String, String>,
}

#[derive(Serialize)]
pub struct ProfileReport {
    pub status: String,
    pub message: String,
}

/// The aggregate verdict printed on stdout.
#[derive(Serialize)]
pub struct FinalResult {
    pub status: String,
    pub message: String,
    pub total: usize,
    #[serde(rename = "proceed")]
    pub proceeded: usize,
    #[serde(rename = "proceederror")]
    pub errored: usize,
    #[serde(rename = "succeed")]
    pub succeeded: usize,
    pub workers: usize,
    pub results: BTreeMap<String, ProfileReport>,
}

impl FinalResult {
    /// Verdict for a failure that prevented the batch from running at all.
    pub fn fatal(message: String) -> Self {
        FinalResult {
            status: "error".to_string(),
            message,
            total: 0,
            proceeded: 0,
            errored: 0,
            succeeded: 0,
            workers: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.status == "ok" {
            0
        } else {
            1
        }
    }
}

/// Accumulates job outcomes into the final verdict.
pub struct BatchTally {
    total: usize,
    workers: usize,
    proceeded: usize,
    succeeded: usize,
    errored: usize,
    results: BTreeMap<String, ProfileReport>,
}

impl BatchTally {
    pub fn new(total: usize, workers: usize) -> Self {
        BatchTally {
            total,
            workers,
            proceeded: 0,
            succeeded: 0,
            errored: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, outcome: JobOutcome) {
        self.proceeded += 1;
        let report = match outcome.result {
            Ok(message) => {
                self.succeeded += 1;
                ProfileReport {
                    status: "ok".to_string(),
                    message,
                }
            }
            Err(message) => {
                self.errored += 1;
                ProfileReport {
                    status: "error".to_string(),
                    message,
                }
            }
        };
        self.results.insert(outcome.profile_id, report);
    }

    pub fn into_result(self) -> FinalResult {
        let failed = self.errored > 0 || self.proceeded == 0 || self.proceeded != self.total;
        let message = if failed {
            format!(
                "{} of {} profile(s) failed",
                self.total - self.succeeded,
                self.total
            )
        } else {
            format!("all {} profile(s) reachable", self.total)
        };
        self.build(failed, message)
    }

    /// Verdict when the global deadline fires before every job reported.
    pub fn into_deadline_result(self) -> FinalResult {
        self.build(true, "runtimeout".to_string())
    }

    fn build(self, failed: bool, message: String) -> FinalResult {
        FinalResult {
            status: if failed { "error" } else { "ok" }.to_string(),
            message,
            total: self.total,
            proceeded: self.proceeded,
            errored: self.errored,
            succeeded: self.succeeded,
            workers: self.workers,
            results: self.results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile(id: &str, sequence: u32) -> Profile {
        Profile {
            id: id.to_string(),
            sequence,
            inner_addr: "10.0.0.2".parse().unwrap(),
            dns_servers: vec!["1.1.1.1".to_string()],
            private_key_hex: "aa".repeat(32),
            peer_allowed_ips: vec!["0.0.0.0/0".to_string()],
            peer_endpoint_ip: "203.0.113.1".parse().unwrap(),
            peer_endpoint_port: 51820,
            peer_public_key_hex: "bb".repeat(32),
        }
    }

    #[test]
    fn interface_name_uses_prefix() {
        let profile = sample_profile("alpha", 1);
        assert_eq!(profile.interface_name(), "wg_alpha");
    }

    #[test]
    fn table_id_offsets_sequence() {
        let profile = sample_profile("alpha", 7);
        assert_eq!(profile.table_id(), 1007);
        assert_eq!(profile.fwmark(), 7);
    }

    #[test]
    fn interface_name_limit() {
        assert!(interface_name_fits("twelve-chars"));
        assert!(!interface_name_fits("thirteen-chars"));
    }

    #[test]
    fn tally_all_ok() {
        let mut tally = BatchTally::new(2, 1);
        tally.record(JobOutcome {
            profile_id: "a".to_string(),
            result: Ok("rtt=3ms".to_string()),
        });
        tally.record(JobOutcome {
            profile_id: "b".to_string(),
            result: Ok("rtt=5ms".to_string()),
        });
        let result = tally.into_result();
        assert_eq!(result.status, "ok");
        assert_eq!(result.proceeded, 2);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.errored, 0);
        assert_eq!(result.exit_code(), 0);
    }

    #[test]
    fn tally_error_when_any_job_failed() {
        let mut tally = BatchTally::new(2, 2);
        tally.record(JobOutcome {
            profile_id: "a".to_string(),
            result: Ok("rtt=3ms".to_string()),
        });
        tally.record(JobOutcome {
            profile_id: "b".to_string(),
            result: Err("timeout context".to_string()),
        });
        let result = tally.into_result();
        assert_eq!(result.status, "error");
        assert_eq!(result.errored, 1);
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn tally_error_when_incomplete() {
        let mut tally = BatchTally::new(3, 1);
        tally.record(JobOutcome {
            profile_id: "a".to_string(),
            result: Ok("rtt=3ms".to_string()),
        });
        let result = tally.into_result();
        assert_eq!(result.status, "error");
        assert_eq!(result.proceeded, 1);
    }

    #[test]
    fn deadline_result_is_runtimeout() {
        let tally = BatchTally::new(4, 2);
        let result = tally.into_deadline_result();
        assert_eq!(result.status, "error");
        assert_eq!(result.message, "runtimeout");
        assert_eq!(result.total, 4);
    }

    #[test]
    fn verdict_wire_field_names() {
        let mut tally = BatchTally::new(1, 1);
        tally.record(JobOutcome {
            profile_id: "a".to_string(),
            result: Ok("rtt=1ms".to_string()),
        });
        let json = serde_json::to_value(tally.into_result()).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["total"], 1);
        assert_eq!(json["proceed"], 1);
        assert_eq!(json["proceederror"], 0);
        assert_eq!(json["succeed"], 1);
        assert_eq!(json["workers"], 1);
        assert_eq!(json["results"]["a"]["status"], "ok");
    }
}
