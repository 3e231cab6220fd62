//! Address family identifiers (AFI/SAFI pairs).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// Address Family Identifier values used by the VPN families.
pub mod afi {
    pub const IPV4: u16 = 1;
    pub const IPV6: u16 = 2;
    pub const L2VPN: u16 = 25;
}

/// Subsequent Address Family Identifier values used by the VPN families.
pub mod safi {
    pub const EVPN: u8 = 70;
    pub const MPLS_VPN: u8 = 128;
    pub const RTC: u8 = 132;
    pub const FLOW_VPN: u8 = 134;
}

/// A routing family, identified by its (AFI, SAFI) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct AddressFamily {
    pub afi: u16,
    pub safi: u8,
}

impl AddressFamily {
    pub const IPV4_MPLS_VPN: AddressFamily = AddressFamily::new(afi::IPV4, safi::MPLS_VPN);
    pub const IPV6_MPLS_VPN: AddressFamily = AddressFamily::new(afi::IPV6, safi::MPLS_VPN);
    pub const L2VPN_EVPN: AddressFamily = AddressFamily::new(afi::L2VPN, safi::EVPN);
    pub const IPV4_FLOW_VPN: AddressFamily = AddressFamily::new(afi::IPV4, safi::FLOW_VPN);
    pub const IPV4_RTC: AddressFamily = AddressFamily::new(afi::IPV4, safi::RTC);

    pub const fn new(afi: u16, safi: u8) -> Self {
        Self { afi, safi }
    }

    pub fn is_rtc(&self) -> bool {
        *self == Self::IPV4_RTC
    }
}

/// Families a session offers by default, RTC excluded.
pub const DEFAULT_FAMILIES: [AddressFamily; 3] = [
    AddressFamily::IPV4_MPLS_VPN,
    AddressFamily::L2VPN_EVPN,
    AddressFamily::IPV4_FLOW_VPN,
];

/// Textual names, both directions.
const NAMES: [(AddressFamily, &str); 5] = [
    (AddressFamily::IPV4_MPLS_VPN, "ipv4/mpls-vpn"),
    (AddressFamily::IPV6_MPLS_VPN, "ipv6/mpls-vpn"),
    (AddressFamily::L2VPN_EVPN, "l2vpn/evpn"),
    (AddressFamily::IPV4_FLOW_VPN, "ipv4/flow-vpn"),
    (AddressFamily::IPV4_RTC, "ipv4/rtc"),
];

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NAMES.iter().find(|(family, _)| family == self) {
            Some((_, name)) => f.write_str(name),
            None => write!(f, "{}/{}", self.afi, self.safi),
        }
    }
}

/// Error returned when an address family string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid address family: {0}")]
pub struct ParseFamilyError(String);

impl FromStr for AddressFamily {
    type Err = ParseFamilyError;

    /// Accepts a well-known name (`l2vpn/evpn`) or a numeric `afi/safi` pair.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((family, _)) = NAMES.iter().find(|(_, name)| name.eq_ignore_ascii_case(s)) {
            return Ok(*family);
        }

        let (afi, safi) = s
            .split_once('/')
            .ok_or_else(|| ParseFamilyError(s.to_string()))?;
        let afi = afi.parse().map_err(|_| ParseFamilyError(s.to_string()))?;
        let safi = safi.parse().map_err(|_| ParseFamilyError(s.to_string()))?;
        Ok(AddressFamily::new(afi, safi))
    }
}

impl TryFrom<String> for AddressFamily {
    type Error = ParseFamilyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
