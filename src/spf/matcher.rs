//-
// Copyright (c) 2023, 2024, Jason Lingle
//
// This file is part of Spfeval.
//
// Spfeval is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Spfeval is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Spfeval. If not, see <http://www.gnu.org/licenses/>.

//! Address and network matching for `ip4`, `ip6`, `a`, and `mx`.
//!
//! Literals and prefix lengths are validated here, at match time, rather than
//! when the record is parsed. A malformed value only affects the directive
//! that carries it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("malformed IP address literal")]
    InvalidAddress,
    #[error("malformed CIDR prefix length")]
    InvalidPrefix,
}

/// The optional IPv4 and IPv6 prefix lengths of an `a` or `mx` value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: Option<u32>,
    pub v6: Option<u32>,
}

/// Splits an `a` or `mx` value of the form `domain[/len4][//len6]` into the
/// domain part and its prefix lengths.
///
/// The domain part may be empty, in which case the current domain applies.
pub fn split_dual_cidr(value: &str) -> Result<(&str, DualCidr), Error> {
    let (rest, v6) = match value.rsplit_once("//") {
        Some((rest, len)) => (rest, Some(parse_prefix(len, 128)?)),
        None => (value, None),
    };

    let (domain, v4) = match rest.rsplit_once('/') {
        Some((domain, len))
            if !len.is_empty() && len.bytes().all(|b| b.is_ascii_digit()) =>
        {
            (domain, Some(parse_prefix(len, 32)?))
        },
        _ => (rest, None),
    };

    Ok((domain, DualCidr { v4, v6 }))
}

/// Evaluates an `ip4` value against `ip`.
///
/// An IPv6 client never matches, though the value is still validated.
pub fn matches_ip4(ip: IpAddr, value: &str) -> Result<bool, Error> {
    let (addr, cidr_len) = split_literal(value, 32)?;
    let net = addr
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::InvalidAddress)?;

    Ok(match ip {
        IpAddr::V4(ip) => ipv4_addr_matches(ip, net, cidr_len),
        IpAddr::V6(_) => false,
    })
}

/// Evaluates an `ip6` value against `ip`.
///
/// An IPv4 client never matches, though the value is still validated.
pub fn matches_ip6(ip: IpAddr, value: &str) -> Result<bool, Error> {
    let (addr, cidr_len) = split_literal(value, 128)?;
    let net = addr
        .parse::<Ipv6Addr>()
        .map_err(|_| Error::InvalidAddress)?;

    Ok(match ip {
        IpAddr::V6(ip) => ipv6_addr_matches(ip, net, cidr_len),
        IpAddr::V4(_) => false,
    })
}

/// Whether `candidate`, an address found in DNS, covers `ip` under the prefix
/// length for its family.
///
/// Addresses of different families never match.
pub fn matches_address(ip: IpAddr, candidate: IpAddr, cidr: DualCidr) -> bool {
    match (ip, candidate.to_canonical()) {
        (IpAddr::V4(ip), IpAddr::V4(candidate)) => {
            ipv4_addr_matches(ip, candidate, cidr.v4)
        },
        (IpAddr::V6(ip), IpAddr::V6(candidate)) => {
            ipv6_addr_matches(ip, candidate, cidr.v6)
        },
        _ => false,
    }
}

fn split_literal(value: &str, max: u32) -> Result<(&str, Option<u32>), Error> {
    match value.split_once('/') {
        None => Ok((value, None)),
        Some((addr, len)) => Ok((addr, Some(parse_prefix(len, max)?))),
    }
}

fn parse_prefix(s: &str, max: u32) -> Result<u32, Error> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPrefix);
    }

    s.parse::<u32>()
        .ok()
        .filter(|&len| len <= max)
        .ok_or(Error::InvalidPrefix)
}

fn ipv4_addr_matches(a: Ipv4Addr, b: Ipv4Addr, cidr_len: Option<u32>) -> bool {
    if let Some(len) = cidr_len {
        let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
        let a = u32::from_be_bytes(a.octets());
        let b = u32::from_be_bytes(b.octets());
        (a & mask) == (b & mask)
    } else {
        a == b
    }
}

fn ipv6_addr_matches(a: Ipv6Addr, b: Ipv6Addr, cidr_len: Option<u32>) -> bool {
    if let Some(len) = cidr_len {
        let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
        let a = u128::from_be_bytes(a.octets());
        let b = u128::from_be_bytes(b.octets());
        (a & mask) == (b & mask)
    } else {
        a == b
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ip4_literals() {
        let client = ip("198.51.100.10");
        assert_eq!(Ok(true), matches_ip4(client, "198.51.100.10"));
        assert_eq!(Ok(false), matches_ip4(ip("1.2.3.4"), "198.51.100.10"));
        assert_eq!(Ok(true), matches_ip4(client, "198.51.100.0/24"));
        assert_eq!(Ok(true), matches_ip4(client, "198.51.100.10/32"));
        assert_eq!(Ok(false), matches_ip4(client, "198.51.101.0/24"));
        assert_eq!(Ok(true), matches_ip4(client, "0.0.0.0/0"));
        assert_eq!(Ok(true), matches_ip4(client, "198.0.0.0/7"));
        assert_eq!(Ok(false), matches_ip4(ip("2001:db8::1"), "0.0.0.0/0"));
    }

    #[test]
    fn ip6_literals() {
        let client = ip("2001:db8::cb01");
        assert_eq!(Ok(true), matches_ip6(client, "2001:db8::cb01"));
        assert_eq!(Ok(true), matches_ip6(client, "2001:db8::/32"));
        assert_eq!(Ok(false), matches_ip6(client, "2001:db9::/32"));
        assert_eq!(Ok(true), matches_ip6(client, "::/0"));
        assert_eq!(Ok(true), matches_ip6(client, "2001:db8::cb00/120"));
        assert_eq!(Ok(false), matches_ip6(client, "2001:db8::cb00/128"));
        assert_eq!(Ok(false), matches_ip6(ip("192.0.2.1"), "::/0"));
    }

    #[test]
    fn malformed_literals() {
        let client = ip("192.0.2.1");
        assert_eq!(
            Err(Error::InvalidPrefix),
            matches_ip4(client, "1.2.3.0/33"),
        );
        assert_eq!(Err(Error::InvalidPrefix), matches_ip4(client, "1.2.3.0/"));
        assert_eq!(
            Err(Error::InvalidPrefix),
            matches_ip4(client, "1.2.3.0/+8"),
        );
        assert_eq!(Err(Error::InvalidAddress), matches_ip4(client, "1.2.3"));
        assert_eq!(Err(Error::InvalidAddress), matches_ip4(client, "::1"));
        assert_eq!(Err(Error::InvalidAddress), matches_ip6(client, "1.2.3.4"));
        assert_eq!(Err(Error::InvalidPrefix), matches_ip6(client, "::/129"));
        // Validation does not depend on the client's address family.
        assert_eq!(
            Err(Error::InvalidPrefix),
            matches_ip4(ip("::1"), "1.2.3.0/40"),
        );
    }

    #[test]
    fn dual_cidr_splitting() {
        assert_eq!(Ok(("", DualCidr::default())), split_dual_cidr(""));
        assert_eq!(
            Ok(("example.com", DualCidr::default())),
            split_dual_cidr("example.com"),
        );
        assert_eq!(
            Ok((
                "example.com",
                DualCidr {
                    v4: Some(24),
                    v6: None,
                },
            )),
            split_dual_cidr("example.com/24"),
        );
        assert_eq!(
            Ok((
                "example.com",
                DualCidr {
                    v4: None,
                    v6: Some(64),
                },
            )),
            split_dual_cidr("example.com//64"),
        );
        assert_eq!(
            Ok((
                "example.com",
                DualCidr {
                    v4: Some(24),
                    v6: Some(64),
                },
            )),
            split_dual_cidr("example.com/24//64"),
        );
        assert_eq!(
            Ok((
                "",
                DualCidr {
                    v4: Some(16),
                    v6: Some(48),
                },
            )),
            split_dual_cidr("/16//48"),
        );
        // A non-numeric suffix is left for domain validation to reject.
        assert_eq!(
            Ok(("example.com/abc", DualCidr::default())),
            split_dual_cidr("example.com/abc"),
        );

        assert_eq!(
            Err(Error::InvalidPrefix),
            split_dual_cidr("example.com/33"),
        );
        assert_eq!(
            Err(Error::InvalidPrefix),
            split_dual_cidr("example.com//129"),
        );
        assert_eq!(
            Err(Error::InvalidPrefix),
            split_dual_cidr("example.com//"),
        );
    }

    #[test]
    fn address_matching() {
        let v4 = DualCidr {
            v4: Some(24),
            v6: None,
        };
        assert!(matches_address(ip("192.0.2.77"), ip("192.0.2.1"), v4));
        assert!(!matches_address(ip("192.0.3.77"), ip("192.0.2.1"), v4));
        assert!(!matches_address(
            ip("192.0.2.77"),
            ip("192.0.2.1"),
            DualCidr::default(),
        ));
        assert!(matches_address(
            ip("192.0.2.1"),
            ip("::ffff:192.0.2.1"),
            DualCidr::default(),
        ));
        assert!(!matches_address(ip("2001:db8::1"), ip("192.0.2.1"), v4));

        let v6 = DualCidr {
            v4: None,
            v6: Some(64),
        };
        assert!(matches_address(ip("2001:db8::1"), ip("2001:db8::ffff"), v6));
        assert!(!matches_address(
            ip("2001:db8:1::1"),
            ip("2001:db8::ffff"),
            v6,
        ));
    }
}
