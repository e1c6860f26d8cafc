//! Input validation and normalization for client identity and addressing.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Normalize and validate a client identifier.
///
/// Ids are trimmed and lower-cased; they must be non-empty and consist only
/// of ASCII letters, digits, `_` and `-`.
pub fn normalize_id(raw: &str) -> Result<String> {
    let id = raw.trim().to_ascii_lowercase();
    if id.is_empty() {
        return Err(Error::validation("Client name is required"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::validation(format!(
            "Invalid client name format '{}' (use alphanumeric, _, -)",
            raw.trim()
        )));
    }
    Ok(id)
}

/// Normalize a MAC address to upper-case, colon-separated form.
///
/// Accepts six two-digit hex octets separated by `:` or `-`.
pub fn normalize_mac(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let invalid = || Error::validation(format!("Invalid MAC address format '{}'", raw));

    let octets: Vec<&str> = raw.split(|c| c == ':' || c == '-').collect();
    if octets.len() != 6 {
        return Err(invalid());
    }
    for octet in &octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
    }
    Ok(octets.join(":").to_ascii_uppercase())
}

/// Validate a dotted-quad IPv4 address.
pub fn normalize_ip(raw: &str) -> Result<String> {
    let raw = raw.trim();
    raw.parse::<Ipv4Addr>()
        .map(|ip| ip.to_string())
        .map_err(|_| Error::validation(format!("Invalid IP address format '{}'", raw)))
}

/// Validate a master image reference: a dataset name, optionally with a
/// pool-relative path.
pub fn validate_master(raw: &str) -> Result<String> {
    let master = raw.trim();
    if master.is_empty() {
        return Err(Error::validation("Master image is required"));
    }
    if master.contains('@') || master.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!(
            "Invalid master image '{}'",
            master
        )));
    }
    Ok(master.to_string())
}

/// Validate an explicit checkpoint reference of the form `dataset@name`.
pub fn validate_snapshot(raw: &str) -> Result<String> {
    let snapshot = raw.trim();
    match snapshot.split_once('@') {
        Some((dataset, name))
            if !dataset.is_empty()
                && !name.is_empty()
                && !snapshot.chars().any(char::is_whitespace) =>
        {
            Ok(snapshot.to_string())
        }
        _ => Err(Error::validation(format!(
            "Invalid snapshot '{}' (expected dataset@name)",
            snapshot
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id() {
        assert_eq!(normalize_id(" Lab_01 ").unwrap(), "lab_01");
        assert_eq!(normalize_id("pc-7").unwrap(), "pc-7");
        assert!(normalize_id("").is_err());
        assert!(normalize_id("lab 01").is_err());
        assert!(normalize_id("lab/01").is_err());
        assert!(matches!(normalize_id("a.b"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(
            normalize_mac("aa-bb-cc-dd-ee-0f").unwrap(),
            "AA:BB:CC:DD:EE:0F"
        );
        assert_eq!(
            normalize_mac("AA:BB:CC:DD:EE:01").unwrap(),
            "AA:BB:CC:DD:EE:01"
        );
        assert!(normalize_mac("AA:BB:CC:DD:EE").is_err());
        assert!(normalize_mac("AA:BB:CC:DD:EE:GG").is_err());
        assert!(normalize_mac("AAA:BB:CC:DD:EE:01").is_err());
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip("192.168.1.101").unwrap(), "192.168.1.101");
        assert!(normalize_ip("192.168.1").is_err());
        assert!(normalize_ip("192.168.1.300").is_err());
        assert!(normalize_ip("host.lan").is_err());
    }

    #[test]
    fn test_validate_snapshot() {
        assert!(validate_snapshot("nsboot0/win11-master@v2").is_ok());
        assert!(validate_snapshot("nsboot0/win11-master").is_err());
        assert!(validate_snapshot("@v2").is_err());
    }

    #[test]
    fn test_validate_master() {
        assert_eq!(validate_master(" win11-master ").unwrap(), "win11-master");
        assert!(validate_master("").is_err());
        assert!(validate_master("win11@base").is_err());
    }
}
