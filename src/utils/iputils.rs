//! IP list parsing and normalization.
//!
//! Host lists arrive as comma separated entries that may be a plain IP, an
//! `ip:port` pair or an inclusive range like `192.168.0.2-192.168.0.6`.
//! Everything downstream works on the flat, expanded form.

use crate::error::PreflightError;
use std::net::Ipv4Addr;

/// Strict dotted-quad check. `std` is lenient about some historical forms,
/// this is not: exactly four parts, plain decimal, no leading zeros.
pub fn is_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| {
        if p.is_empty() || p.len() > 3 || !p.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if p.len() > 1 && p.starts_with('0') {
            return false;
        }
        p.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
    })
}

/// Strip an optional `:port` suffix from a host address.
pub fn ip_format(host: &str) -> &str {
    match host.split_once(':') {
        Some((ip, _)) => ip,
        None => host,
    }
}

fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

fn parse_strict(s: &str) -> Result<Ipv4Addr, PreflightError> {
    if !is_ipv4(s) {
        return Err(PreflightError::InvalidIp(s.to_string()));
    }
    s.parse::<Ipv4Addr>()
        .map_err(|_| PreflightError::InvalidIp(s.to_string()))
}

/// Expand a list of address expressions into a flat list of addresses,
/// order preserved. Ranges are inclusive; an explicit `:port` on a plain
/// address is kept as-is.
pub fn parse_ips(ips: &[String]) -> Result<Vec<String>, PreflightError> {
    let mut res = Vec::new();
    for entry in ips {
        for part in entry.split(',').filter(|p| !p.trim().is_empty()) {
            let part = part.trim();
            let (addr, port) = match part.split_once(':') {
                Some((a, p)) => (a, Some(p)),
                None => (part, None),
            };
            if let Some((start, end)) = addr.split_once('-') {
                let mut cur = parse_strict(start)?;
                let last = parse_strict(end)?;
                if u32::from(cur) > u32::from(last) {
                    return Err(PreflightError::InvalidIpRange(addr.to_string()));
                }
                while u32::from(cur) <= u32::from(last) {
                    match port {
                        Some(p) => res.push(format!("{}:{}", cur, p)),
                        None => res.push(cur.to_string()),
                    }
                    cur = next_ip(cur);
                }
            } else {
                parse_strict(addr)?;
                res.push(part.to_string());
            }
        }
    }
    Ok(res)
}

/// Expand and deduplicate, keeping first occurrence order. Used when
/// re-normalizing the persisted state on dump.
pub fn normalize_ips(ips: &[String]) -> Result<Vec<String>, PreflightError> {
    let expanded = parse_ips(ips)?;
    let mut seen = Vec::new();
    for ip in expanded {
        if !seen.contains(&ip) {
            seen.push(ip);
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        let got = parse_ips(&["192.168.0.2-192.168.0.4".to_string()]).unwrap();
        assert_eq!(got, vec!["192.168.0.2", "192.168.0.3", "192.168.0.4"]);
    }

    #[test]
    fn test_parse_plain_and_port() {
        let got = parse_ips(&["10.0.0.1".to_string(), "10.0.0.2:2222".to_string()]).unwrap();
        assert_eq!(got, vec!["10.0.0.1", "10.0.0.2:2222"]);
    }

    #[test]
    fn test_parse_comma_list() {
        let got = parse_ips(&["10.0.0.1,10.0.0.3-10.0.0.4".to_string()]).unwrap();
        assert_eq!(got, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse_ips(&["10.0.0.256".to_string()]).is_err());
        assert!(parse_ips(&["10.0.0.9-10.0.0.2".to_string()]).is_err());
        assert!(parse_ips(&["not-an-ip".to_string()]).is_err());
    }

    #[test]
    fn test_is_ipv4() {
        assert!(is_ipv4("192.168.0.1"));
        assert!(is_ipv4("0.0.0.0"));
        assert!(is_ipv4("255.255.255.255"));
        assert!(!is_ipv4("192.168.00.1"));
        assert!(!is_ipv4("192.168.0.256"));
        assert!(!is_ipv4("192.168.0"));
        assert!(!is_ipv4("192.168.0.1.5"));
        assert!(!is_ipv4("192.168.0.a"));
        assert!(!is_ipv4(""));
    }

    #[test]
    fn test_ip_format() {
        assert_eq!(ip_format("10.0.0.1:22"), "10.0.0.1");
        assert_eq!(ip_format("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_normalize_dedup() {
        let got = normalize_ips(&[
            "10.0.0.1-10.0.0.2".to_string(),
            "10.0.0.2".to_string(),
        ])
        .unwrap();
        assert_eq!(got, vec!["10.0.0.1", "10.0.0.2"]);
    }
}
