//! Networking primitives for allocation pools.
//!
//! This library provides helpers for:
//! - Bind address validation and canonical formatting
//! - Port specifications (`"25565"`, `"25565-25570"`, `"25565,27015-27020"`)
//! - Endpoint formatting for IPv4 and IPv6 binds

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    /// A port token that is not a number or range.
    #[error("invalid port specification: {0}")]
    InvalidPortSpec(String),

    /// Port outside the allocatable window.
    #[error("port {port} outside allocatable range {floor}-{ceil}")]
    PortOutOfRange { port: u32, floor: u16, ceil: u16 },

    /// Range written high-to-low.
    #[error("port range {start}-{end} is reversed")]
    ReversedRange { start: u16, end: u16 },

    /// Too many ports requested at once.
    #[error("port specification expands to {count} ports (limit {limit})")]
    TooManyPorts { count: usize, limit: usize },
}

// ============================================================================
// Bind Addresses
// ============================================================================

/// An IP address an allocation binds to, in canonical textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindAddress(IpAddr);

impl BindAddress {
    /// Parse an IPv4 or IPv6 literal. Surrounding brackets are accepted for IPv6.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let trimmed = s.trim();
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed);

        IpAddr::from_str(unbracketed)
            .map(Self)
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// `0.0.0.0` / `::`.
    pub fn is_wildcard(&self) -> bool {
        self.0.is_unspecified()
    }

    /// Socket endpoint for this address, bracketed for IPv6.
    pub fn endpoint(&self, port: u16) -> String {
        SocketAddr::new(self.0, port).to_string()
    }
}

impl std::fmt::Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BindAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BindAddress {
    type Error = NetworkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BindAddress> for String {
    fn from(value: BindAddress) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Port Specifications
// ============================================================================

/// Lowest port an allocation may use. Privileged ports are never handed out.
pub const PORT_FLOOR: u16 = 1024;

/// Highest port an allocation may use.
pub const PORT_CEIL: u16 = 65535;

/// Maximum ports a single specification may expand to.
pub const PORT_SPEC_LIMIT: usize = 1000;

/// A parsed, deduplicated, ascending set of ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    ports: BTreeSet<u16>,
}

impl PortSpec {
    /// Parse a comma separated list of ports and inclusive ranges.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let mut ports = BTreeSet::new();

        for token in s.split(',').map(str::trim) {
            if token.is_empty() {
                return Err(NetworkError::InvalidPortSpec(s.to_string()));
            }

            match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_port(start.trim(), s)?;
                    let end = parse_port(end.trim(), s)?;
                    if start > end {
                        return Err(NetworkError::ReversedRange { start, end });
                    }
                    ports.extend(start..=end);
                }
                None => {
                    ports.insert(parse_port(token, s)?);
                }
            }

            if ports.len() > PORT_SPEC_LIMIT {
                return Err(NetworkError::TooManyPorts {
                    count: ports.len(),
                    limit: PORT_SPEC_LIMIT,
                });
            }
        }

        Ok(Self { ports })
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().copied()
    }
}

impl FromStr for PortSpec {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_port(token: &str, spec: &str) -> Result<u16, NetworkError> {
    let value: u32 = token
        .parse()
        .map_err(|_| NetworkError::InvalidPortSpec(spec.to_string()))?;
    validate_port(value)
}

/// Validate that a port lies in the allocatable window.
pub fn validate_port(port: u32) -> Result<u16, NetworkError> {
    if port < u32::from(PORT_FLOOR) || port > u32::from(PORT_CEIL) {
        return Err(NetworkError::PortOutOfRange {
            port,
            floor: PORT_FLOOR,
            ceil: PORT_CEIL,
        });
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_canonical() {
        let v4 = BindAddress::parse(" 10.0.0.1 ").unwrap();
        assert_eq!(v4.to_string(), "10.0.0.1");
        assert_eq!(v4.endpoint(25565), "10.0.0.1:25565");

        let v6 = BindAddress::parse("[2001:db8::0:1]").unwrap();
        assert_eq!(v6.to_string(), "2001:db8::1");
        assert_eq!(v6.endpoint(25565), "[2001:db8::1]:25565");

        assert!(BindAddress::parse("0.0.0.0").unwrap().is_wildcard());
        assert!(BindAddress::parse("play.example.com").is_err());
    }

    #[test]
    fn test_port_spec_mixed() {
        let spec = PortSpec::parse("25565, 27015-27017,25565").unwrap();
        let ports: Vec<u16> = spec.iter().collect();
        assert_eq!(ports, vec![25565, 27015, 27016, 27017]);
    }

    #[test]
    fn test_port_spec_rejections() {
        assert!(matches!(
            PortSpec::parse("80"),
            Err(NetworkError::PortOutOfRange { port: 80, .. })
        ));
        assert!(matches!(
            PortSpec::parse("70000"),
            Err(NetworkError::PortOutOfRange { .. })
        ));
        assert!(matches!(
            PortSpec::parse("25570-25565"),
            Err(NetworkError::ReversedRange { .. })
        ));
        assert!(matches!(
            PortSpec::parse("25565,,25566"),
            Err(NetworkError::InvalidPortSpec(_))
        ));
        assert!(matches!(
            PortSpec::parse("20000-21000"),
            Err(NetworkError::TooManyPorts { count: 1001, .. })
        ));
    }

    #[test]
    fn test_limit_is_inclusive() {
        assert_eq!(PortSpec::parse("20000-20999").unwrap().len(), PORT_SPEC_LIMIT);
    }

    #[test]
    fn test_limit_counts_distinct_ports() {
        let spec = PortSpec::parse("1024-1623,1024-1623,1500").unwrap();
        assert_eq!(spec.len(), 600);
        assert!(matches!(
            PortSpec::parse("1024-1623,1600-2100"),
            Err(NetworkError::TooManyPorts { count: 1077, .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_single_ports_inside_window(port in PORT_FLOOR..=PORT_CEIL) {
            let spec = PortSpec::parse(&port.to_string()).unwrap();
            proptest::prop_assert_eq!(spec.iter().collect::<Vec<_>>(), vec![port]);
        }

        #[test]
        fn prop_ranges_expand_inclusively(start in PORT_FLOOR..60000u16, width in 0u16..200) {
            let end = start + width;
            let spec = PortSpec::parse(&format!("{start}-{end}")).unwrap();
            proptest::prop_assert_eq!(spec.len(), usize::from(width) + 1);
            proptest::prop_assert_eq!(spec.iter().next(), Some(start));
            proptest::prop_assert_eq!(spec.iter().last(), Some(end));
        }
    }
}
