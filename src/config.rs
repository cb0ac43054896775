use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

pub const DEFAULT_PROBE_ENDPOINT: &str = "1.0.0.1";

pub const LOG_ERROR: u32 = 1;
pub const LOG_CRITICAL: u32 = 1 << 1;
pub const LOG_INFO: u32 = 1 << 2;
pub const LOG_DEBUG: u32 = 1 << 3;
pub const LOG_STATISTICS: u32 = 1 << 4;
const DEFAULT_LOG_MASK: u32 = LOG_ERROR | LOG_CRITICAL | LOG_INFO | LOG_DEBUG;

#[derive(Parser, Debug)]
#[command(
    name = "wgprobe",
    about = "Probes reachability through a batch of WireGuard profiles"
)]
pub struct Args {
    /// Probe to run through each tunnel: icmp, dns, tcp or http.
    #[arg(long, env = "HEALTHCHECK_METHOD", default_value = "icmp")]
    pub method: String,
    /// Probe target: a host for icmp/dns, host:port for tcp, a URL for http.
    #[arg(long, env = "HEALTHCHECK_ENDPOINT", default_value = DEFAULT_PROBE_ENDPOINT)]
    pub endpoint: String,
    /// Per-attempt timeout in milliseconds.
    #[arg(long, env = "HEALTHCHECK_TIMEOUT", default_value_t = 3000)]
    pub timeout: u64,
    /// Sleep between probe attempts in milliseconds.
    #[arg(long, env = "HEALTHCHECK_INTERVAL", default_value_t = 1000)]
    pub interval: u64,
    /// Attempts per probe.
    #[arg(long, env = "HEALTHCHECK_RETRIES", default_value_t = 3)]
    pub retries: u32,
    /// Total budget for one profile's probe in milliseconds.
    #[arg(long, env = "HEALTHCHECK_RUNTIMEOUT", default_value_t = 10_000)]
    pub run_timeout: u64,
    /// Whole-batch budget in milliseconds.
    #[arg(long, env = "RUNTIMEOUT", default_value_t = 30_000)]
    pub batch_timeout: u64,
    /// Worker count.
    #[arg(long, env = "WORKER", default_value_t = 8)]
    pub workers: usize,
    /// HTTP source for the profile map; takes precedence over file and dir.
    #[arg(long, env = "REMOTE_PROFILE_PATH")]
    pub remote_profiles: Option<String>,
    /// JSON file mapping profile id to base64 quick-config.
    #[arg(long, env = "PROFILE_PATH")]
    pub profiles: Option<PathBuf>,
    /// Directory of <id>.conf quick-config files.
    #[arg(long, env = "PROFILE_DIR")]
    pub profiles_dir: Option<PathBuf>,
    /// Log verbosity bitmask: 1 error, 2 critical, 4 info, 8 debug, 16 statistics.
    #[arg(long, env = "DEBUG_LEVEL", default_value_t = DEFAULT_LOG_MASK)]
    pub debug_level: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeMethod {
    Icmp,
    Dns,
    Tcp,
    Http,
}

impl ProbeMethod {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "icmp" => Ok(ProbeMethod::Icmp),
            "dns" => Ok(ProbeMethod::Dns),
            "tcp" => Ok(ProbeMethod::Tcp),
            "http" => Ok(ProbeMethod::Http),
            other => Err(anyhow!("unknown health check method {:?}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeMethod::Icmp => "icmp",
            ProbeMethod::Dns => "dns",
            ProbeMethod::Tcp => "tcp",
            ProbeMethod::Http => "http",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub method: ProbeMethod,
    pub endpoint: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub retries: u32,
    pub run_timeout: Duration,
    pub batch_timeout: Duration,
    pub workers: usize,
    pub remote_profiles: Option<String>,
    pub profiles_file: Option<PathBuf>,
    pub profiles_dir: Option<PathBuf>,
    pub debug_level: u32,
}

impl AppConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        let method = ProbeMethod::parse(&args.method)?;
        if args.workers == 0 {
            return Err(anyhow!("worker count must be at least 1"));
        }
        if args.retries == 0 {
            return Err(anyhow!("retries must be at least 1"));
        }
        Ok(AppConfig {
            method,
            endpoint: rewrite_default_endpoint(method, args.endpoint),
            timeout: Duration::from_millis(args.timeout),
            interval: Duration::from_millis(args.interval),
            retries: args.retries,
            run_timeout: Duration::from_millis(args.run_timeout),
            batch_timeout: Duration::from_millis(args.batch_timeout),
            workers: args.workers,
            remote_profiles: args.remote_profiles,
            profiles_file: args.profiles,
            profiles_dir: args.profiles_dir,
            debug_level: args.debug_level,
        })
    }
}

/// tcp and http need a port or URL; the rewrite applies only while the
/// endpoint is still exactly the built-in default.
fn rewrite_default_endpoint(method: ProbeMethod, endpoint: String) -> String {
    if endpoint != DEFAULT_PROBE_ENDPOINT {
        return endpoint;
    }
    match method {
        ProbeMethod::Tcp => format!("{}:80", DEFAULT_PROBE_ENDPOINT),
        ProbeMethod::Http => format!("http://{}/cdn-cgi/trace", DEFAULT_PROBE_ENDPOINT),
        ProbeMethod::Icmp | ProbeMethod::Dns => endpoint,
    }
}

pub fn log_level(mask: u32) -> LevelFilter {
    if mask & (LOG_DEBUG | LOG_STATISTICS) != 0 {
        LevelFilter::DEBUG
    } else if mask & LOG_INFO != 0 {
        LevelFilter::INFO
    } else if mask & LOG_CRITICAL != 0 {
        LevelFilter::WARN
    } else if mask & LOG_ERROR != 0 {
        LevelFilter::ERROR
    } else {
        LevelFilter::OFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            method: "icmp".to_string(),
            endpoint: DEFAULT_PROBE_ENDPOINT.to_string(),
            timeout: 3000,
            interval: 1000,
            retries: 3,
            run_timeout: 10_000,
            batch_timeout: 30_000,
            workers: 8,
            remote_profiles: None,
            profiles: None,
            profiles_dir: None,
            debug_level: DEFAULT_LOG_MASK,
        }
    }

    #[test]
    fn parses_probe_methods() {
        assert_eq!(ProbeMethod::parse("icmp").unwrap(), ProbeMethod::Icmp);
        assert_eq!(ProbeMethod::parse("http").unwrap(), ProbeMethod::Http);
        assert!(ProbeMethod::parse("udp").is_err());
    }

    #[test]
    fn default_endpoint_rewritten_for_tcp() {
        let mut args = base_args();
        args.method = "tcp".to_string();
        let config = AppConfig::from_args(args).unwrap();
        assert_eq!(config.endpoint, "1.0.0.1:80");
    }

    #[test]
    fn default_endpoint_rewritten_for_http() {
        let mut args = base_args();
        args.method = "http".to_string();
        let config = AppConfig::from_args(args).unwrap();
        assert_eq!(config.endpoint, "http://1.0.0.1/cdn-cgi/trace");
    }

    #[test]
    fn custom_endpoint_untouched() {
        let mut args = base_args();
        args.method = "tcp".to_string();
        args.endpoint = "1.0.0.1:443".to_string();
        let config = AppConfig::from_args(args).unwrap();
        assert_eq!(config.endpoint, "1.0.0.1:443");
    }

    #[test]
    fn icmp_keeps_default_endpoint() {
        let config = AppConfig::from_args(base_args()).unwrap();
        assert_eq!(config.endpoint, DEFAULT_PROBE_ENDPOINT);
    }

    #[test]
    fn durations_are_milliseconds() {
        let config = AppConfig::from_args(base_args()).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(3000));
        assert_eq!(config.batch_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut args = base_args();
        args.workers = 0;
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn log_level_follows_most_verbose_bit() {
        assert_eq!(log_level(LOG_ERROR), LevelFilter::ERROR);
        assert_eq!(log_level(LOG_ERROR | LOG_CRITICAL), LevelFilter::WARN);
        assert_eq!(log_level(LOG_INFO), LevelFilter::INFO);
        assert_eq!(log_level(DEFAULT_LOG_MASK), LevelFilter::DEBUG);
        assert_eq!(log_level(LOG_STATISTICS), LevelFilter::DEBUG);
        assert_eq!(log_level(0), LevelFilter::OFF);
    }
}
