//! Address arithmetic over a canonical 16-byte form.
//!
//! IPv4 addresses are held as IPv4-mapped IPv6 (`::ffff:a.b.c.d`), so
//! comparison is plain big-endian byte order for both families. Increment
//! carries from the least-significant byte and never leaves the family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    bytes: [u8; 16],
    v4: bool,
}

impl Address {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                bytes: v4.to_ipv6_mapped().octets(),
                v4: true,
            },
            IpAddr::V6(v6) => Self {
                bytes: v6.octets(),
                v4: false,
            },
        }
    }

    pub fn to_ip(self) -> IpAddr {
        if self.v4 {
            let [.., a, b, c, d] = self.bytes;
            IpAddr::V4(Ipv4Addr::new(a, b, c, d))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.bytes))
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.v4
    }

    /// The following address, or `None` past the end of the family.
    pub fn successor(self) -> Option<Self> {
        let floor = if self.v4 { 12 } else { 0 };
        let mut bytes = self.bytes;
        for i in (floor..16).rev() {
            if bytes[i] == u8::MAX {
                bytes[i] = 0;
            } else {
                bytes[i] += 1;
                return Some(Self { bytes, v4: self.v4 });
            }
        }
        None
    }

    /// Number of addresses in `[self, end]`; zero when `end < self`.
    pub fn span_to(&self, end: &Address) -> u128 {
        let start = u128::from_be_bytes(self.bytes);
        let end = u128::from_be_bytes(end.bytes);
        if end < start {
            0
        } else {
            (end - start).saturating_add(1)
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::from_ip(s.parse().unwrap())
    }

    #[test]
    fn test_increment_with_carry() {
        assert_eq!(addr("10.0.0.1").successor(), Some(addr("10.0.0.2")));
        assert_eq!(addr("10.0.0.255").successor(), Some(addr("10.0.1.0")));
        assert_eq!(addr("10.255.255.255").successor(), Some(addr("11.0.0.0")));
        assert_eq!(addr("2001:db8::ffff").successor(), Some(addr("2001:db8::1:0")));
    }

    #[test]
    fn test_increment_stops_at_family_end() {
        assert_eq!(addr("255.255.255.255").successor(), None);
        assert_eq!(addr("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff").successor(), None);
    }

    #[test]
    fn test_ordering_and_span() {
        assert!(addr("10.0.0.9") < addr("10.0.0.10"));
        assert!(addr("10.0.1.0") > addr("10.0.0.255"));
        assert_eq!(addr("10.0.0.1").span_to(&addr("10.0.0.10")), 10);
        assert_eq!(addr("10.0.0.5").span_to(&addr("10.0.0.5")), 1);
        assert_eq!(addr("10.0.0.5").span_to(&addr("10.0.0.4")), 0);
        assert_eq!(addr("fd00::").span_to(&addr("fd00::ff")), 256);
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(addr("192.168.1.20").to_string(), "192.168.1.20");
        assert_eq!(addr("fd00::1").to_string(), "fd00::1");
        assert!(addr("192.168.1.20").is_ipv4());
    }
}
