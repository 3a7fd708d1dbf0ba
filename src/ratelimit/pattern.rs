//! Rule pattern compilation and matching.
//!
//! Patterns are compiled once when a rule is created or updated and the
//! resulting [`Pattern`] is stored alongside the rule, so a request check
//! only walks precompiled segments or octets.

use std::net::IpAddr;

use super::rules::Scope;
use crate::error::{Result, TurnstileError};

/// A compiled rule pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// `*`: matches every subject
    Any,
    /// Exact string equality
    Exact(String),
    /// `*` expands to any substring
    Wildcard(Wildcard),
    /// Dotted IPv4 wildcard such as `192.168.1.*`, one slot per octet
    Octets([Option<u8>; 4]),
    /// CIDR block such as `10.0.0.0/8` or `fd00::/8`
    Cidr(Cidr),
}

/// Literal segments of a wildcard pattern, split on `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wildcard {
    segments: Vec<String>,
    leading_star: bool,
    trailing_star: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4 { network: u32, prefix: u8 },
    V6 { network: u128, prefix: u8 },
}

impl Pattern {
    /// Compile a raw pattern string for the given scope.
    pub fn compile(scope: Scope, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TurnstileError::Configuration(
                "pattern must not be empty".to_string(),
            ));
        }
        if raw == "*" {
            return Ok(Pattern::Any);
        }

        match scope {
            Scope::Ip if raw.contains('/') => Cidr::parse(raw).map(Pattern::Cidr),
            Scope::Ip if raw.contains('*') => parse_octets(raw).map(Pattern::Octets),
            Scope::Ip => Ok(Pattern::Exact(raw.to_string())),
            _ if raw.contains('*') => Ok(Pattern::Wildcard(Wildcard::new(raw))),
            _ => Ok(Pattern::Exact(raw.to_string())),
        }
    }

    /// Check whether a subject (ip, user id, endpoint path) matches.
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(expected) => expected == subject,
            Pattern::Wildcard(wildcard) => wildcard.matches(subject),
            Pattern::Octets(octets) => match subject.parse::<IpAddr>() {
                Ok(IpAddr::V4(addr)) => octets
                    .iter()
                    .zip(addr.octets())
                    .all(|(slot, octet)| slot.map_or(true, |want| want == octet)),
                _ => false,
            },
            Pattern::Cidr(cidr) => subject
                .parse::<IpAddr>()
                .map(|addr| cidr.contains(addr))
                .unwrap_or(false),
        }
    }
}

impl Wildcard {
    fn new(raw: &str) -> Self {
        Self {
            segments: raw
                .split('*')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            leading_star: raw.starts_with('*'),
            trailing_star: raw.ends_with('*'),
        }
    }

    fn matches(&self, subject: &str) -> bool {
        let mut rest = subject;
        let last = self.segments.len().saturating_sub(1);

        for (i, segment) in self.segments.iter().enumerate() {
            if i == 0 && !self.leading_star {
                match rest.strip_prefix(segment.as_str()) {
                    Some(tail) => rest = tail,
                    None => return false,
                }
            } else if i == last && !self.trailing_star {
                return rest.len() >= segment.len() && rest.ends_with(segment.as_str());
            } else {
                match rest.find(segment.as_str()) {
                    Some(pos) => rest = &rest[pos + segment.len()..],
                    None => return false,
                }
            }
        }

        // A pattern without a trailing star must consume the whole subject.
        self.trailing_star || rest.is_empty()
    }
}

impl Cidr {
    fn parse(raw: &str) -> Result<Self> {
        let invalid = || TurnstileError::Configuration(format!("invalid CIDR pattern: {}", raw));
        let (addr, prefix) = raw.split_once('/').ok_or_else(invalid)?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;

        match addr.parse::<IpAddr>().map_err(|_| invalid())? {
            IpAddr::V4(v4) if prefix <= 32 => Ok(Cidr::V4 {
                network: u32::from(v4) & v4_mask(prefix),
                prefix,
            }),
            IpAddr::V6(v6) if prefix <= 128 => Ok(Cidr::V6 {
                network: u128::from(v6) & v6_mask(prefix),
                prefix,
            }),
            _ => Err(invalid()),
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Cidr::V4 { network, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & v4_mask(*prefix) == *network
            }
            (Cidr::V6 { network, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & v6_mask(*prefix) == *network
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0)
}

/// Parse `a.b.c.*` style patterns. A trailing `*` covers any missing octets.
fn parse_octets(raw: &str) -> Result<[Option<u8>; 4]> {
    let parts: Vec<&str> = raw.split('.').collect();
    let padded = parts.len() < 4 && parts.last() == Some(&"*");
    if parts.len() > 4 || (parts.len() < 4 && !padded) {
        return Err(TurnstileError::Configuration(format!(
            "invalid IP wildcard pattern: {}",
            raw
        )));
    }

    let mut octets = [None; 4];
    for (slot, part) in octets.iter_mut().zip(parts.iter()) {
        *slot = match *part {
            "*" => None,
            n => Some(n.parse::<u8>().map_err(|_| {
                TurnstileError::Configuration(format!("invalid octet '{}' in pattern {}", n, raw))
            })?),
        };
    }
    Ok(octets)
}
