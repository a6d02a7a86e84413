//! Hardware addresses for pod ports

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A MAC address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress {
    inner: [u8; 6],
}

impl MacAddress {
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.inner
    }

    /// Deterministic MAC for a pod address: `0a:58` followed by the last four
    /// bytes of the IP.
    pub fn from_ip(ip: IpAddr) -> Self {
        let tail = match ip {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(v6) => {
                let o = v6.octets();
                [o[12], o[13], o[14], o[15]]
            }
        };
        Self::from_bytes([0x0a, 0x58, tail[0], tail[1], tail[2], tail[3]])
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // One separator throughout: colons or dashes, never both.
        let separator = if s.contains('-') { '-' } else { ':' };
        let octets: Vec<u8> = s
            .split(separator)
            .map(|part| {
                if part.len() != 2 {
                    return Err(format!("bad octet: {part}"));
                }
                u8::from_str_radix(part, 16).map_err(|_| format!("bad octet: {part}"))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let bytes: [u8; 6] = octets
            .as_slice()
            .try_into()
            .map_err(|_| format!("incorrect number of bytes: {}", octets.len()))?;
        Ok(Self::from_bytes(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.inner;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_ip_uses_last_four_bytes() {
        let mac = MacAddress::from_ip("10.1.2.3".parse().unwrap());
        assert_eq!(mac.to_string(), "0a:58:0a:01:02:03");

        let mac = MacAddress::from_ip("fd00::a0b:c0d".parse().unwrap());
        assert_eq!(mac.to_string(), "0a:58:0a:0b:0c:0d");
    }

    #[test]
    fn test_parse_accepts_both_separators() {
        let colon: MacAddress = "0A:58:0a:01:02:03".parse().unwrap();
        let dash: MacAddress = "0a-58-0a-01-02-03".parse().unwrap();
        assert_eq!(colon, dash);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("0a:58:0a:01:02".parse::<MacAddress>().is_err());
        assert!("0a:58:0a:01:02:zz".parse::<MacAddress>().is_err());
        assert!("0a:58:0a:01:02:003".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_parse_rejects_mixed_separators() {
        assert!("0a:58-0a:01-02:03".parse::<MacAddress>().is_err());
        assert!("0a-58-0a-01-02:03".parse::<MacAddress>().is_err());
    }
}
