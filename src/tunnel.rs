use crate::model::{Job, Profile};
use crate::netlink::Netlink;
use crate::probe::{self, ProbeSettings};
use anyhow::{anyhow, Context, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::debug;

const ENGINE_BINARY: &str = "/bin/wireguard-go";
const CONTROL_SOCKET_DIR: &str = "/var/run/wireguard";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const LINK_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const CONTROL_RESPONSE_LIMIT: usize = 512;
// Engine output kept for failure reports; drop the tail past this.
const ENGINE_LOG_CAP: usize = 4096;

/// Shared, read-only state every worker needs to drive its jobs.
pub struct RunContext {
    pub netlink: Netlink,
    pub default_gateway: Ipv4Addr,
    pub settings: ProbeSettings,
}

/// Drives one job to a terminal state. The tunnel is torn down on every
/// exit path past a successful engine spawn.
pub async fn run_job(
    ctx: &RunContext,
    worker_id: usize,
    subjob: usize,
    job: &Job,
) -> Result<String> {
    let mut session = TunnelSession::spawn(&job.profile)?;
    let outcome = session.bring_up_and_probe(ctx, worker_id, subjob).await;
    session.teardown(ctx).await;
    outcome
}

struct TunnelSession {
    profile: Profile,
    interface: String,
    child: Child,
    engine_log: Arc<Mutex<String>>,
    link_index: Option<u32>,
}

impl TunnelSession {
    fn spawn(profile: &Profile) -> Result<Self> {
        let interface = profile.interface_name();
        let mut child = Command::new(ENGINE_BINARY)
            .arg("-f")
            .arg(&interface)
            .env("LOG_LEVEL", "debug")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {} for {}", ENGINE_BINARY, interface))?;
        let engine_log = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            spawn_drain(stdout, interface.clone(), Arc::clone(&engine_log));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(stderr, interface.clone(), Arc::clone(&engine_log));
        }
        Ok(TunnelSession {
            profile: profile.clone(),
            interface,
            child,
            engine_log,
            link_index: None,
        })
    }

    async fn bring_up_and_probe(
        &mut self,
        ctx: &RunContext,
        worker_id: usize,
        subjob: usize,
    ) -> Result<String> {
        self.wait_for_control_socket().await?;
        self.configure().await?;
        self.install_network(ctx, subjob).await?;
        probe::run(&ctx.settings, worker_id, subjob, &self.profile).await
    }

    fn control_socket_path(&self) -> PathBuf {
        Path::new(CONTROL_SOCKET_DIR).join(format!("{}.sock", self.interface))
    }

    async fn wait_for_control_socket(&self) -> Result<()> {
        let path = self.control_socket_path();
        let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
        loop {
            match UnixStream::connect(&path).await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if Instant::now() >= deadline {
                        let captured = self
                            .engine_log
                            .lock()
                            .map(|log| log.trim().to_string())
                            .unwrap_or_default();
                        if captured.is_empty() {
                            return Err(anyhow!(
                                "control socket {} did not appear: {}",
                                path.display(),
                                err
                            ));
                        }
                        return Err(anyhow!(
                            "control socket {} did not appear; engine output: {}",
                            path.display(),
                            captured
                        ));
                    }
                }
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn configure(&self) -> Result<()> {
        let request = build_uapi_request(&self.profile);
        let mut stream = UnixStream::connect(self.control_socket_path())
            .await
            .with_context(|| format!("control socket connect failed for {}", self.interface))?;
        stream
            .write_all(request.as_bytes())
            .await
            .context("control socket write failed")?;
        let mut buf = vec![0u8; CONTROL_RESPONSE_LIMIT];
        let len = stream
            .read(&mut buf)
            .await
            .context("control socket read failed")?;
        let response = String::from_utf8_lossy(&buf[..len]);
        debug!("[{}] control response: {}", self.interface, response.trim_end());
        check_uapi_response(&response)
    }

    async fn install_network(&mut self, ctx: &RunContext, subjob: usize) -> Result<()> {
        let profile = &self.profile;
        let netlink = &ctx.netlink;
        let index = netlink
            .wait_for_link(&self.interface, LINK_WAIT_TIMEOUT)
            .await?;
        self.link_index = Some(index);
        netlink
            .add_address(index, profile.inner_addr)
            .await
            .with_context(|| format!("addr add {}/32 dev {}", profile.inner_addr, self.interface))?;
        netlink
            .set_link_up(index)
            .await
            .with_context(|| format!("link set {} up", self.interface))?;
        // The first job of an endpoint group pins the underlay; later
        // jobs find it restored by the previous teardown.
        if subjob == 0 {
            netlink
                .add_endpoint_route(profile.peer_endpoint_ip, ctx.default_gateway)
                .await
                .with_context(|| {
                    format!(
                        "route add {}/32 via {}",
                        profile.peer_endpoint_ip, ctx.default_gateway
                    )
                })?;
        }
        netlink
            .add_tunnel_default_route(profile.inner_addr, index, profile.table_id())
            .await
            .with_context(|| {
                format!(
                    "route add default via {} table {}",
                    profile.inner_addr,
                    profile.table_id()
                )
            })?;
        netlink
            .add_source_rule(profile.inner_addr, profile.table_id())
            .await
            .with_context(|| {
                format!(
                    "rule add from {}/32 table {}",
                    profile.inner_addr,
                    profile.table_id()
                )
            })?;
        Ok(())
    }

    /// Best-effort cleanup; every step runs, failures are only logged.
    async fn teardown(&mut self, ctx: &RunContext) {
        let profile = &self.profile;
        let netlink = &ctx.netlink;
        if let Some(index) = self.link_index {
            if let Err(err) = netlink.delete_address(index, profile.inner_addr).await {
                debug!("[{}] teardown addr delete: {:#}", self.interface, err);
            }
        }
        if let Err(err) = netlink.delete_link(&self.interface).await {
            debug!("[{}] teardown link delete: {:#}", self.interface, err);
        }
        // Keep the underlay pin present for the next job probing the
        // same peer endpoint; the add usually reports the route as
        // already installed.
        if let Err(err) = netlink
            .add_endpoint_route(profile.peer_endpoint_ip, ctx.default_gateway)
            .await
        {
            debug!("[{}] teardown endpoint route restore: {:#}", self.interface, err);
        }
        if let Some(index) = self.link_index {
            if let Err(err) = netlink
                .delete_tunnel_default_route(profile.inner_addr, index, profile.table_id())
                .await
            {
                debug!("[{}] teardown table route delete: {:#}", self.interface, err);
            }
        }
        if let Err(err) = netlink
            .delete_source_rule(profile.inner_addr, profile.table_id())
            .await
        {
            debug!("[{}] teardown rule delete: {:#}", self.interface, err);
        }
        if let Err(err) = self.child.kill().await {
            debug!("[{}] engine kill: {}", self.interface, err);
        }
    }
}

fn spawn_drain<R>(stream: R, interface: String, sink: Arc<Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] {}", interface, line);
            if let Ok(mut log) = sink.lock() {
                if log.len() < ENGINE_LOG_CAP {
                    log.push_str(&line);
                    log.push('\n');
                }
            }
        }
    });
}

fn build_uapi_request(profile: &Profile) -> String {
    let mut request = String::new();
    request.push_str("set=1\n");
    request.push_str(&format!("private_key={}\n", profile.private_key_hex));
    request.push_str(&format!("fwmark={}\n", profile.fwmark()));
    request.push_str(&format!("public_key={}\n", profile.peer_public_key_hex));
    for allowed in &profile.peer_allowed_ips {
        request.push_str(&format!("allowed_ip={}\n", allowed));
    }
    request.push_str(&format!(
        "endpoint={}:{}\n",
        profile.peer_endpoint_ip, profile.peer_endpoint_port
    ));
    request.push('\n');
    request.push_str("get=1\n");
    request
}

fn check_uapi_response(response: &str) -> Result<()> {
    for line in response.lines() {
        if let Some(code) = line.strip_prefix("errno=") {
            if code.trim() != "0" {
                return Err(anyhow!("engine rejected configuration: {}", line.trim()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> Profile {
        Profile {
            id: "alpha".to_string(),
            sequence: 3,
            inner_addr: "10.66.66.2".parse().unwrap(),
            dns_servers: vec!["1.1.1.1".to_string()],
            private_key_hex: "aa".repeat(32),
            peer_allowed_ips: vec!["0.0.0.0/0".to_string(), "10.0.0.0/8".to_string()],
            peer_endpoint_ip: "203.0.113.1".parse().unwrap(),
            peer_endpoint_port: 51820,
            peer_public_key_hex: "bb".repeat(32),
        }
    }

    #[test]
    fn uapi_request_layout() {
        let request = build_uapi_request(&sample_profile());
        let expected = format!(
            "set=1\n\
             private_key={}\n\
             fwmark=3\n\
             public_key={}\n\
             allowed_ip=0.0.0.0/0\n\
             allowed_ip=10.0.0.0/8\n\
             endpoint=203.0.113.1:51820\n\
             \n\
             get=1\n",
            "aa".repeat(32),
            "bb".repeat(32)
        );
        assert_eq!(request, expected);
    }

    #[test]
    fn uapi_response_accepts_errno_zero() {
        assert!(check_uapi_response("fwmark=3\nerrno=0\n\n").is_ok());
    }

    #[test]
    fn uapi_response_rejects_nonzero_errno() {
        let err = check_uapi_response("errno=-22\n\n").unwrap_err();
        assert!(err.to_string().contains("errno=-22"));
    }

    #[test]
    fn uapi_response_without_errno_passes() {
        assert!(check_uapi_response("public_key=ab\n").is_ok());
    }
}
