use anyhow::{anyhow, Context, Result};
use std::net::Ipv4Addr;

const PROC_ROUTE_PATH: &str = "/proc/net/route";

/// Reads the host's default IPv4 gateway from the kernel route table.
/// Called once at startup; every underlay pin route depends on it.
pub fn default_gateway() -> Result<Ipv4Addr> {
    let contents = std::fs::read_to_string(PROC_ROUTE_PATH)
        .with_context(|| format!("failed to read {}", PROC_ROUTE_PATH))?;
    parse_gateway(&contents)
}

fn parse_gateway(contents: &str) -> Result<Ipv4Addr> {
    let line = contents
        .lines()
        .nth(1)
        .ok_or_else(|| anyhow!("route table has no entries"))?;
    let gateway_hex = line
        .split('\t')
        .nth(2)
        .ok_or_else(|| anyhow!("route entry has no gateway field: {:?}", line))?;
    // The kernel prints the address as a host-order u32 in hex; octets
    // come out in little-endian order.
    let raw = u32::from_str_radix(gateway_hex.trim(), 16)
        .with_context(|| format!("invalid gateway field {:?}", gateway_hex))?;
    let gateway = Ipv4Addr::from(raw.to_le_bytes());
    if gateway.is_unspecified() {
        return Err(anyhow!("no default route"));
    }
    Ok(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT";

    #[test]
    fn parses_little_endian_gateway() {
        let table = format!(
            "{}\neth0\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0\n",
            HEADER
        );
        let gateway = parse_gateway(&table).unwrap();
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn rejects_empty_table() {
        let err = parse_gateway(&format!("{}\n", HEADER)).unwrap_err();
        assert!(err.to_string().contains("no entries"));
    }

    #[test]
    fn rejects_zero_gateway() {
        let table = format!(
            "{}\neth0\t0000FEA9\t00000000\t0001\t0\t0\t0\t0000FFFF\t0\t0\t0\n",
            HEADER
        );
        let err = parse_gateway(&table).unwrap_err();
        assert!(err.to_string().contains("no default route"));
    }

    #[test]
    fn rejects_malformed_hex() {
        let table = format!("{}\neth0\t00000000\tzzzz\t0003\n", HEADER);
        assert!(parse_gateway(&table).is_err());
    }
}
