use crate::config::AppConfig;
use crate::model::{self, Profile};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tracing::{error, warn};

/// Loads the profile batch. Source precedence: remote URL, then JSON
/// file, then a directory of `<id>.conf` files.
pub async fn load(config: &AppConfig) -> Result<Vec<Profile>> {
    let raw = if let Some(url) = &config.remote_profiles {
        fetch_remote(url).await?
    } else if let Some(path) = &config.profiles_file {
        read_file(path)?
    } else if let Some(dir) = &config.profiles_dir {
        read_directory(dir)?
    } else {
        return Err(anyhow!(
            "no profile source configured; set REMOTE_PROFILE_PATH, PROFILE_PATH or PROFILE_DIR"
        ));
    };
    build_profiles(raw)
}

async fn fetch_remote(url: &str) -> Result<BTreeMap<String, String>> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("profile fetch from {} failed", url))?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "profile fetch from {} returned {}",
            url,
            response.status()
        ));
    }
    response
        .json()
        .await
        .context("remote profile map is not valid JSON")
}

fn read_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile file {}", path.display()))?;
    serde_json::from_str(&contents).context("profile map is not valid JSON")
}

fn read_directory(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read profile directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("conf") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        map.insert(id.to_string(), STANDARD.encode(contents));
    }
    Ok(map)
}

/// Profile ids are ingested through a sorted map so sequence numbers,
/// and everything keyed off them, are stable across runs.
fn build_profiles(raw: BTreeMap<String, String>) -> Result<Vec<Profile>> {
    let mut profiles: Vec<Profile> = Vec::new();
    for (id, encoded) in raw {
        if !model::interface_name_fits(&id) {
            return Err(anyhow!(
                "profile id {:?} too long: interface name {}{} exceeds {} characters",
                id,
                model::INTERFACE_PREFIX,
                id,
                model::MAX_INTERFACE_NAME
            ));
        }
        let sequence = profiles.len() as u32 + 1;
        match parse_profile(&id, sequence, &encoded) {
            Ok(profile) => profiles.push(profile),
            Err(err) => error!("profile {} rejected: {:#}", id, err),
        }
    }
    if profiles.is_empty() {
        return Err(anyhow!("no usable profiles in batch"));
    }
    warn_inner_collisions(&profiles);
    Ok(profiles)
}

fn warn_inner_collisions(profiles: &[Profile]) {
    for (i, left) in profiles.iter().enumerate() {
        for right in &profiles[i + 1..] {
            if left.inner_addr == right.inner_addr {
                warn!(
                    "profiles {} and {} share interface address {}; they will run sequentially",
                    left.id, right.id, left.inner_addr
                );
            }
        }
    }
}

fn parse_profile(id: &str, sequence: u32, encoded: &str) -> Result<Profile> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("profile payload is not base64")?;
    let text = String::from_utf8(bytes).context("profile payload is not UTF-8")?;
    let quick = parse_quick_config(&text)?;
    let inner_addr: Ipv4Addr = strip_cidr(&quick.address)
        .parse()
        .with_context(|| format!("invalid interface address {:?}", quick.address))?;
    let (peer_endpoint_ip, peer_endpoint_port) = split_endpoint(&quick.endpoint)?;
    Ok(Profile {
        id: id.to_string(),
        sequence,
        inner_addr,
        dns_servers: split_list(&quick.dns),
        private_key_hex: key_to_hex(&quick.private_key).context("invalid PrivateKey")?,
        peer_allowed_ips: parse_allowed_ips(&quick.allowed_ips, id),
        peer_endpoint_ip,
        peer_endpoint_port,
        peer_public_key_hex: key_to_hex(&quick.public_key).context("invalid PublicKey")?,
    })
}

#[derive(Debug)]
struct QuickConfig {
    address: String,
    dns: String,
    private_key: String,
    allowed_ips: String,
    endpoint: String,
    public_key: String,
}

fn parse_quick_config(text: &str) -> Result<QuickConfig> {
    let mut section = String::new();
    let mut saw_interface = false;
    let mut address = None;
    let mut dns = None;
    let mut private_key = None;
    let mut allowed_ips = None;
    let mut endpoint = None;
    let mut public_key = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].to_string();
            if section == "Interface" {
                saw_interface = true;
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match (section.as_str(), key) {
            ("Interface", "Address") => address = Some(value.to_string()),
            ("Interface", "DNS") => dns = Some(value.to_string()),
            ("Interface", "PrivateKey") => private_key = Some(value.to_string()),
            ("Peer", "AllowedIPs") => allowed_ips = Some(value.to_string()),
            ("Peer", "Endpoint") => endpoint = Some(value.to_string()),
            ("Peer", "PublicKey") => public_key = Some(value.to_string()),
            _ => {}
        }
    }

    if !saw_interface {
        return Err(anyhow!("missing [Interface] section"));
    }
    Ok(QuickConfig {
        address: address.ok_or_else(|| anyhow!("missing Interface.Address"))?,
        dns: dns.unwrap_or_default(),
        private_key: private_key.ok_or_else(|| anyhow!("missing Interface.PrivateKey"))?,
        allowed_ips: allowed_ips.ok_or_else(|| anyhow!("missing Peer.AllowedIPs"))?,
        endpoint: endpoint.ok_or_else(|| anyhow!("missing Peer.Endpoint"))?,
        public_key: public_key.ok_or_else(|| anyhow!("missing Peer.PublicKey"))?,
    })
}

fn strip_cidr(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Entries the engine would reject are dropped here with a warning so
/// one typo does not fail the whole tunnel configuration.
fn parse_allowed_ips(raw: &str, id: &str) -> Vec<String> {
    split_list(raw)
        .into_iter()
        .filter(|entry| {
            let valid = entry.parse::<IpNet>().is_ok() || entry.parse::<IpAddr>().is_ok();
            if !valid {
                warn!("profile {}: skipping invalid allowed ip {:?}", id, entry);
            }
            valid
        })
        .collect()
}

fn split_endpoint(endpoint: &str) -> Result<(Ipv4Addr, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("endpoint {:?} has no port", endpoint))?;
    let ip = host
        .parse()
        .with_context(|| format!("endpoint host {:?} is not an IPv4 address", host))?;
    let port = port
        .parse()
        .with_context(|| format!("endpoint port {:?} is not a port number", port))?;
    Ok((ip, port))
}

/// The engine's control protocol takes keys as lowercase hex of the raw
/// 32 bytes, not the base64 the quick-config carries.
fn key_to_hex(encoded: &str) -> Result<String> {
    let bytes = STANDARD.decode(encoded.trim()).context("not base64")?;
    if bytes.len() != 32 {
        return Err(anyhow!("expected 32 bytes, got {}", bytes.len()));
    }
    Ok(hex::encode(bytes))
}
