use crate::config::{AppConfig, ProbeMethod};
use crate::model::Profile;
use anyhow::{anyhow, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, TcpSocket, UdpSocket};
use tokio::time::{sleep, timeout, timeout_at, Instant as TokioInstant};
use tracing::debug;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_PACKET_COUNT: u16 = 3;
const ICMP_SEND_INTERVAL: Duration = Duration::from_millis(250);
const ICMP_REPLY_TIMEOUT: Duration = Duration::from_millis(800);
const ICMP_PAYLOAD_LEN: usize = 112;
const ICMP_ACCEPTABLE_LOSS: f64 = 0.99;

const DNS_PORT: u16 = 53;
const DNS_DIAL_TIMEOUT: Duration = Duration::from_millis(2000);

/// The knobs shared by every probe attempt.
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub method: ProbeMethod,
    pub endpoint: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub retries: u32,
    pub run_timeout: Duration,
}

impl ProbeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        ProbeSettings {
            method: config.method,
            endpoint: config.endpoint.clone(),
            timeout: config.timeout,
            interval: config.interval,
            retries: config.retries,
            run_timeout: config.run_timeout,
        }
    }
}

/// Attempt errors split into the two retry classes: timeouts keep
/// retrying inside the run budget, everything else surfaces immediately.
enum AttemptError {
    Retry(anyhow::Error),
    Abort(anyhow::Error),
}

pub(crate) fn job_description(
    worker_id: usize,
    subjob: usize,
    inner: Ipv4Addr,
    endpoint: &str,
    method: ProbeMethod,
) -> String {
    format!(
        "[Worker#{},Subjob#{},{},{}/{}] ",
        worker_id,
        subjob,
        inner,
        endpoint,
        method.as_str()
    )
}

/// Runs the configured probe through the tunnel with the shared retry
/// envelope. Returns the success message (with RTT) or the final error.
pub async fn run(
    settings: &ProbeSettings,
    worker_id: usize,
    subjob: usize,
    profile: &Profile,
) -> Result<String> {
    let descr = job_description(
        worker_id,
        subjob,
        profile.inner_addr,
        &settings.endpoint,
        settings.method,
    );
    let deadline = TokioInstant::now() + settings.run_timeout;
    let mut last_error = anyhow!("{}probe was not run", descr);

    for attempt in 0..settings.retries {
        if TokioInstant::now() >= deadline {
            return Err(anyhow!("{}timeout context", descr));
        }
        let result = match timeout_at(deadline, run_attempt(settings, profile.inner_addr)).await {
            Err(_) => return Err(anyhow!("{}timeout context", descr)),
            Ok(result) => result,
        };
        match result {
            Ok(message) => return Ok(format!("{}{}", descr, message)),
            Err(AttemptError::Abort(err)) => return Err(anyhow!("{}{:#}", descr, err)),
            Err(AttemptError::Retry(err)) => {
                debug!("{}attempt {} failed: {:#}", descr, attempt + 1, err);
                last_error = anyhow!("{}{:#}", descr, err);
            }
        }
        if attempt + 1 < settings.retries
            && timeout_at(deadline, sleep(settings.interval)).await.is_err()
        {
            return Err(anyhow!("{}timeout context", descr));
        }
    }
    Err(last_error)
}

async fn run_attempt(settings: &ProbeSettings, source: Ipv4Addr) -> Result<String, AttemptError> {
    match settings.method {
        ProbeMethod::Icmp => icmp_attempt(settings, source).await,
        ProbeMethod::Dns => dns_attempt(settings, source).await,
        ProbeMethod::Tcp => tcp_attempt(settings, source).await,
        ProbeMethod::Http => http_attempt(settings, source).await,
    }
}

// ---------------------------------------------------------------------
// ICMP

async fn icmp_attempt(settings: &ProbeSettings, source: Ipv4Addr) -> Result<String, AttemptError> {
    let target = resolve_icmp_target(&settings.endpoint).await?;
    let stats = tokio::task::spawn_blocking(move || ping(source, target))
        .await
        .map_err(|err| AttemptError::Abort(anyhow!("ping task failed: {}", err)))?
        .map_err(AttemptError::Abort)?;
    let loss = 1.0 - f64::from(stats.received) / f64::from(stats.sent);
    if loss >= ICMP_ACCEPTABLE_LOSS {
        return Err(AttemptError::Retry(anyhow!(
            "all {} echo requests to {} lost",
            stats.sent,
            target
        )));
    }
    let rtt = stats.min_rtt.unwrap_or_default();
    Ok(format!("{} bytes rtt={}ms", ICMP_PAYLOAD_LEN, rtt.as_millis()))
}

async fn resolve_icmp_target(endpoint: &str) -> Result<Ipv4Addr, AttemptError> {
    if let Ok(addr) = endpoint.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    let addrs = lookup_host((endpoint, 0u16))
        .await
        .map_err(|err| AttemptError::Abort(anyhow!("cannot resolve {}: {}", endpoint, err)))?;
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Ok(v4);
        }
    }
    Err(AttemptError::Abort(anyhow!(
        "{} has no IPv4 address",
        endpoint
    )))
}

struct PingStats {
    sent: u16,
    received: u16,
    min_rtt: Option<Duration>,
}

/// Unprivileged echo over a datagram ICMP socket; needs the pid's group
/// inside net.ipv4.ping_group_range. Blocking, run under spawn_blocking.
fn ping(source: Ipv4Addr, target: Ipv4Addr) -> Result<PingStats> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
        .map_err(|err| anyhow!("icmp socket open failed: {}", err))?;
    socket
        .bind(&SocketAddr::new(IpAddr::V4(source), 0).into())
        .map_err(|err| anyhow!("icmp socket bind to {} failed: {}", source, err))?;
    socket
        .set_read_timeout(Some(ICMP_REPLY_TIMEOUT))
        .map_err(|err| anyhow!("icmp socket timeout failed: {}", err))?;
    let socket: std::net::UdpSocket = socket.into();

    let ident: u16 = rand::random();
    let dest = SocketAddr::new(IpAddr::V4(target), 0);
    let mut stats = PingStats {
        sent: 0,
        received: 0,
        min_rtt: None,
    };
    for seq in 0..ICMP_PACKET_COUNT {
        let packet = build_echo_request(ident, seq);
        let started = Instant::now();
        stats.sent += 1;
        match socket.send_to(&packet, dest) {
            Err(err) => debug!("echo request {} to {}: {}", seq, target, err),
            Ok(_) => {
                if let Some(rtt) = await_echo_reply(&socket, seq, started) {
                    stats.received += 1;
                    stats.min_rtt = Some(stats.min_rtt.map_or(rtt, |best| best.min(rtt)));
                }
            }
        }
        if seq + 1 < ICMP_PACKET_COUNT {
            std::thread::sleep(ICMP_SEND_INTERVAL.saturating_sub(started.elapsed()));
        }
    }
    Ok(stats)
}

fn await_echo_reply(socket: &std::net::UdpSocket, seq: u16, started: Instant) -> Option<Duration> {
    let mut buf = [0u8; 256];
    while started.elapsed() < ICMP_REPLY_TIMEOUT {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => {
                if parse_echo_reply(&buf[..len]) == Some(seq) {
                    return Some(started.elapsed());
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return None;
            }
            Err(_) => return None,
        }
    }
    None
}

fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + ICMP_PAYLOAD_LEN];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Datagram ICMP sockets demultiplex replies by socket ident, so only
/// the sequence number needs checking here.
fn parse_echo_reply(packet: &[u8]) -> Option<u16> {
    if packet.len() < 8 {
        return None;
    }
    if packet[0] != ICMP_ECHO_REPLY || packet[1] != 0 {
        return None;
    }
    Some(u16::from_be_bytes([packet[6], packet[7]]))
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum += u32::from(byte) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

// ---------------------------------------------------------------------
// DNS

async fn dns_attempt(settings: &ProbeSettings, source: Ipv4Addr) -> Result<String, AttemptError> {
    let target = resolve_host_port(&settings.endpoint, DNS_PORT).await?;
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(source), 0))
        .await
        .map_err(|err| AttemptError::Abort(anyhow!("dns socket bind failed: {}", err)))?;
    socket
        .connect(target)
        .await
        .map_err(|err| AttemptError::Retry(anyhow!("dns socket connect failed: {}", err)))?;

    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::root(), RecordType::A));
    let request = message
        .to_vec()
        .map_err(|err| AttemptError::Abort(anyhow!("dns query encode failed: {}", err)))?;

    let started = Instant::now();
    let exchange = async {
        socket.send(&request).await?;
        let mut buf = vec![0u8; 512];
        let len = socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok::<_, std::io::Error>(buf)
    };
    let reply = match timeout(DNS_DIAL_TIMEOUT, exchange).await {
        Err(_) => {
            return Err(AttemptError::Retry(anyhow!(
                "dns query to {} timed out after {}ms",
                target,
                DNS_DIAL_TIMEOUT.as_millis()
            )))
        }
        Ok(Err(err)) => {
            return Err(AttemptError::Retry(anyhow!(
                "dns query to {} failed: {}",
                target,
                err
            )))
        }
        Ok(Ok(reply)) => reply,
    };
    let response = Message::from_vec(&reply)
        .map_err(|err| AttemptError::Retry(anyhow!("dns response unparseable: {}", err)))?;
    if response.id() != message.id() {
        return Err(AttemptError::Retry(anyhow!("dns response id mismatch")));
    }
    Ok(format!("rtt={}ms", started.elapsed().as_millis()))
}

// ---------------------------------------------------------------------
// TCP

async fn tcp_attempt(settings: &ProbeSettings, source: Ipv4Addr) -> Result<String, AttemptError> {
    let target = resolve_endpoint(&settings.endpoint).await?;
    let socket = TcpSocket::new_v4()
        .map_err(|err| AttemptError::Abort(anyhow!("tcp socket open failed: {}", err)))?;
    socket
        .bind(SocketAddr::new(IpAddr::V4(source), 0))
        .map_err(|err| AttemptError::Abort(anyhow!("tcp socket bind to {} failed: {}", source, err)))?;
    let started = Instant::now();
    match timeout(settings.timeout, socket.connect(target)).await {
        Err(_) => Err(AttemptError::Retry(anyhow!(
            "connect to {} timed out after {}ms",
            target,
            settings.timeout.as_millis()
        ))),
        Ok(Err(err)) if err.kind() == ErrorKind::TimedOut => Err(AttemptError::Retry(anyhow!(
            "connect to {} timed out: {}",
            target,
            err
        ))),
        Ok(Err(err)) => Err(AttemptError::Abort(anyhow!(
            "connect to {} failed: {}",
            target,
            err
        ))),
        Ok(Ok(_stream)) => Ok(format!("rtt={}ms", started.elapsed().as_millis())),
    }
}

// ---------------------------------------------------------------------
// HTTP

async fn http_attempt(settings: &ProbeSettings, source: Ipv4Addr) -> Result<String, AttemptError> {
    let url = reqwest::Url::parse(&settings.endpoint)
        .map_err(|err| AttemptError::Abort(anyhow!("invalid url {}: {}", settings.endpoint, err)))?;
    let client = reqwest::Client::builder()
        .timeout(settings.timeout)
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(0)
        .local_address(IpAddr::V4(source))
        .build()
        .map_err(|err| AttemptError::Abort(anyhow!("http client build failed: {}", err)))?;
    let started = Instant::now();
    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            return Err(AttemptError::Retry(anyhow!(
                "request to {} timed out: {}",
                url,
                err
            )))
        }
        Err(err) => {
            return Err(AttemptError::Abort(anyhow!(
                "request to {} failed: {}",
                url,
                err
            )))
        }
    };
    let rtt = started.elapsed().as_millis();
    let status = response.status();
    if status.is_success() {
        Ok(format!("rtt={}ms", rtt))
    } else {
        Err(AttemptError::Abort(anyhow!(
            "{} returned status code {}, rtt={}ms",
            url,
            status.as_u16(),
            rtt
        )))
    }
}

// ---------------------------------------------------------------------
// resolution helpers

async fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr, AttemptError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|err| AttemptError::Abort(anyhow!("cannot resolve {}: {}", host, err)))?;
    first_v4(addrs, host)
}

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, AttemptError> {
    let addrs = lookup_host(endpoint)
        .await
        .map_err(|err| AttemptError::Abort(anyhow!("cannot resolve {}: {}", endpoint, err)))?;
    first_v4(addrs, endpoint)
}

fn first_v4(
    addrs: impl Iterator<Item = SocketAddr>,
    endpoint: &str,
) -> Result<SocketAddr, AttemptError> {
    for addr in addrs {
        if addr.is_ipv4() {
            return Ok(addr);
        }
    }
    Err(AttemptError::Abort(anyhow!(
        "{} has no IPv4 address",
        endpoint
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(0x1234, 2);
        assert_eq!(packet.len(), 8 + ICMP_PAYLOAD_LEN);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 2);
        assert_eq!(packet[8], 0);
        assert_eq!(packet[9], 1);
    }

    #[test]
    fn echo_request_checksum_verifies() {
        let packet = build_echo_request(7, 0);
        // Recomputing over the checksummed packet must yield zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn checksum_known_vector() {
        // Example from RFC 1071: 0x0001 + 0xf203 + 0xf4f5 + 0xf6f7.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(icmp_checksum(&data), !0xddf2);
    }

    #[test]
    fn checksum_handles_odd_length() {
        let even = icmp_checksum(&[0xab, 0xcd]);
        let odd = icmp_checksum(&[0xab, 0xcd, 0x01]);
        assert_ne!(even, odd);
    }

    #[test]
    fn reply_parsing_matches_sequence() {
        let mut reply = build_echo_request(9, 5);
        reply[0] = ICMP_ECHO_REPLY;
        assert_eq!(parse_echo_reply(&reply), Some(5));
    }

    #[test]
    fn reply_parsing_rejects_other_types() {
        let request = build_echo_request(9, 5);
        assert_eq!(parse_echo_reply(&request), None);
        assert_eq!(parse_echo_reply(&[0u8; 4]), None);
        let mut unreachable = build_echo_request(9, 5);
        unreachable[0] = 3;
        assert_eq!(parse_echo_reply(&unreachable), None);
    }

    #[test]
    fn description_carries_worker_and_method() {
        let descr = job_description(2, 1, "10.0.0.2".parse().unwrap(), "1.0.0.1", ProbeMethod::Icmp);
        assert_eq!(descr, "[Worker#2,Subjob#1,10.0.0.2,1.0.0.1/icmp] ");
    }

    fn loopback_profile() -> Profile {
        Profile {
            id: "t".to_string(),
            sequence: 1,
            inner_addr: "127.0.0.1".parse().unwrap(),
            dns_servers: Vec::new(),
            private_key_hex: "aa".repeat(32),
            peer_allowed_ips: Vec::new(),
            peer_endpoint_ip: "192.0.2.1".parse().unwrap(),
            peer_endpoint_port: 51820,
            peer_public_key_hex: "bb".repeat(32),
        }
    }

    #[tokio::test]
    async fn run_reports_timeout_context_on_expired_budget() {
        let settings = ProbeSettings {
            method: ProbeMethod::Tcp,
            endpoint: "127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(10),
            retries: 5,
            run_timeout: Duration::ZERO,
        };
        let err = run(&settings, 1, 0, &loopback_profile()).await.unwrap_err();
        assert!(err.to_string().contains("timeout context"));
    }

    #[tokio::test]
    async fn tcp_refused_aborts_without_retry() {
        let settings = ProbeSettings {
            method: ProbeMethod::Tcp,
            // Port 1 on loopback has no listener; connect is refused at
            // once and must not be retried.
            endpoint: "127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(5),
            retries: 3,
            run_timeout: Duration::from_secs(30),
        };
        let started = Instant::now();
        let err = run(&settings, 1, 0, &loopback_profile()).await.unwrap_err();
        assert!(err.to_string().contains("connect to 127.0.0.1:1 failed"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn icmp_target_accepts_literal() {
        let target = resolve_icmp_target("1.0.0.1").await;
        match target {
            Ok(addr) => assert_eq!(addr, Ipv4Addr::new(1, 0, 0, 1)),
            Err(_) => panic!("literal address must not resolve"),
        }
    }
}
