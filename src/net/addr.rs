//! IPv4 addresses and socket addresses
//!
//! ドット区切り10進表記 ("a.b.c.d") の解析/整形と、
//! `(ip, port)` 組を表す [`SockAddr`]。

use core::fmt;
use core::str::FromStr;

use crate::error::Error;

/// IPv4 address (4 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// Any address (0.0.0.0)
    pub const ANY: Ipv4Address = Ipv4Address([0, 0, 0, 0]);

    /// Broadcast address (255.255.255.255)
    pub const BROADCAST: Ipv4Address = Ipv4Address([255, 255, 255, 255]);

    /// Loopback address (127.0.0.1)
    pub const LOOPBACK: Ipv4Address = Ipv4Address([127, 0, 0, 1]);

    pub const fn new(bytes: [u8; 4]) -> Self {
        Ipv4Address(bytes)
    }

    pub const fn from_octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address([a, b, c, d])
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Convert to u32 (network byte order)
    pub const fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Create from u32 (network byte order)
    pub const fn from_u32(value: u32) -> Self {
        Ipv4Address(value.to_be_bytes())
    }

    /// Check if this is the any address
    pub const fn is_any(&self) -> bool {
        self.to_u32() == 0
    }

    pub const fn is_broadcast(&self) -> bool {
        self.to_u32() == u32::MAX
    }

    /// Check if this is a loopback address (127.x.x.x)
    pub const fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// Apply a subnet mask
    pub const fn apply_mask(&self, mask: Ipv4Address) -> Ipv4Address {
        Ipv4Address::from_u32(self.to_u32() & mask.to_u32())
    }

    pub const fn same_subnet(&self, other: &Ipv4Address, mask: Ipv4Address) -> bool {
        (self.to_u32() & mask.to_u32()) == (other.to_u32() & mask.to_u32())
    }

    /// "a.b.c.d" を厳密に解析（各要素 0..=255 の10進数、4要素）
    pub fn parse(s: &str) -> Option<Self> {
        let mut out = [0u8; 4];
        let mut parts = s.split('.');
        for slot in out.iter_mut() {
            let part = parts.next()?;
            if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            *slot = part.parse::<u8>().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Ipv4Address(out))
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Ipv4Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ipv4Address::parse(s).ok_or(Error::InvalidAddress)
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(bytes: [u8; 4]) -> Self {
        Ipv4Address(bytes)
    }
}

// ============================================================================
// Socket Address
// ============================================================================

/// ソケットアドレス（IPv4）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SockAddr {
    pub addr: Ipv4Address,
    pub port: u16,
}

impl SockAddr {
    pub const UNSPECIFIED: Self = Self::new(Ipv4Address::ANY, 0);

    pub const fn new(addr: Ipv4Address, port: u16) -> Self {
        Self { addr, port }
    }

    pub const fn any(port: u16) -> Self {
        Self::new(Ipv4Address::ANY, port)
    }

    pub const fn localhost(port: u16) -> Self {
        Self::new(Ipv4Address::LOOPBACK, port)
    }

    /// ("a.b.c.d", port) から作る
    pub fn from_host(host: &str, port: u16) -> Result<Self, Error> {
        Ok(Self::new(host.parse()?, port))
    }

    /// 6バイトの符号化形式 (addr 4 + port 2, ネットワークバイトオーダー)
    pub fn encode(&self) -> [u8; 6] {
        let a = self.addr.octets();
        let p = self.port.to_be_bytes();
        [a[0], a[1], a[2], a[3], p[0], p[1]]
    }

    pub fn decode(bytes: &[u8; 6]) -> Self {
        Self::new(
            Ipv4Address::new([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
        )
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

// ============================================================================
// MAC address / byte order helpers
// ============================================================================

/// MAC address (6 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub const fn htons(v: u16) -> u16 {
    v.to_be()
}

pub const fn ntohs(v: u16) -> u16 {
    u16::from_be(v)
}

pub const fn htonl(v: u32) -> u32 {
    v.to_be()
}

pub const fn ntohl(v: u32) -> u32 {
    u32::from_be(v)
}

/// ドット区切り表記 → 4バイト (パック形式)
pub fn inet_aton(s: &str) -> Result<[u8; 4], Error> {
    Ok(s.parse::<Ipv4Address>()?.octets())
}

/// 4バイト (パック形式) → ドット区切り表記
pub fn inet_ntoa(packed: &[u8]) -> Result<alloc::string::String, Error> {
    let bytes: [u8; 4] = packed.try_into().map_err(|_| Error::InvalidAddress)?;
    Ok(alloc::format!("{}", Ipv4Address::new(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_quad() {
        assert_eq!(Ipv4Address::parse("127.0.0.1"), Some(Ipv4Address::LOOPBACK));
        assert_eq!(Ipv4Address::parse("0.0.0.0"), Some(Ipv4Address::ANY));
        assert_eq!(
            "192.168.1.20".parse::<Ipv4Address>(),
            Ok(Ipv4Address::from_octets(192, 168, 1, 20))
        );
        for bad in ["", "1.2.3", "1.2.3.4.5", "256.1.1.1", "a.b.c.d", "1..2.3", "+1.2.3.4", "example.com"] {
            assert_eq!(Ipv4Address::parse(bad), None, "{}", bad);
        }
    }

    #[test]
    fn test_display() {
        let a = SockAddr::new(Ipv4Address::from_octets(10, 0, 0, 7), 8080);
        assert_eq!(format!("{}", a), "10.0.0.7:8080");
        let mac = MacAddress([0x02, 0, 0, 0xab, 0xcd, 1]);
        assert_eq!(format!("{}", mac), "02:00:00:ab:cd:01");
    }

    #[test]
    fn test_sockaddr_encoding() {
        let a = SockAddr::new(Ipv4Address::from_octets(1, 2, 3, 4), 0x1234);
        let bytes = a.encode();
        assert_eq!(bytes, [1, 2, 3, 4, 0x12, 0x34]);
        assert_eq!(SockAddr::decode(&bytes), a);
    }

    #[test]
    fn test_inet_helpers() {
        assert_eq!(inet_aton("8.8.4.4"), Ok([8, 8, 4, 4]));
        assert_eq!(inet_ntoa(&[8, 8, 4, 4]).unwrap(), "8.8.4.4");
        assert_eq!(inet_ntoa(&[1, 2, 3]), Err(Error::InvalidAddress));
        assert_eq!(ntohs(htons(0xabcd)), 0xabcd);
        assert_eq!(htonl(1).to_ne_bytes(), [0, 0, 0, 1]);
    }

    #[test]
    fn test_subnet() {
        let mask = Ipv4Address::from_octets(255, 255, 255, 0);
        let a = Ipv4Address::from_octets(192, 168, 1, 20);
        let b = Ipv4Address::from_octets(192, 168, 1, 1);
        assert!(a.same_subnet(&b, mask));
        assert_eq!(a.apply_mask(mask), Ipv4Address::from_octets(192, 168, 1, 0));
    }
}
