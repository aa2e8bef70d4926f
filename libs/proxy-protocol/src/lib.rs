//! PROXY protocol v2 header generation.
//!
//! Headers are prepended to upstream TCP streams and to the first marked
//! datagram of a UDP session so that backends can recover the original
//! client address.
//!
//! Wire format (HAProxy PROXY protocol, version 2, IPv4 only):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length (always 12)
//! - 4 bytes source address, 4 bytes destination address
//! - 2 bytes source port, 2 bytes destination port

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
pub const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Transport protocol: DGRAM (UDP).
const TRANSPORT_DGRAM: u8 = 0x02;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Total size of an encoded IPv4 header.
pub const HEADER_LEN: usize = 16 + IPV4_ADDR_LEN as usize;

/// Errors raised while building a header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyHeaderError {
    /// Only IPv4 (or IPv4-mapped IPv6) endpoints can be encoded.
    #[error("unsupported address for PROXY v2 IPv4 header: {0}")]
    UnsupportedAddress(SocketAddr),
}

/// Transport carried by the proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TCP over IPv4 (`0x11`).
    Tcp,
    /// UDP over IPv4 (`0x12`).
    Udp,
}

impl Transport {
    /// Address family and transport byte.
    pub fn protocol_byte(self) -> u8 {
        match self {
            Transport::Tcp => AF_INET | TRANSPORT_STREAM,
            Transport::Udp => AF_INET | TRANSPORT_DGRAM,
        }
    }

    fn from_protocol_byte(byte: u8) -> Option<Self> {
        match byte {
            x if x == AF_INET | TRANSPORT_STREAM => Some(Transport::Tcp),
            x if x == AF_INET | TRANSPORT_DGRAM => Some(Transport::Udp),
            _ => None,
        }
    }
}

/// PROXY protocol v2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProtocolV2 {
    /// Transport of the proxied traffic.
    pub transport: Transport,
    /// Source (client) address.
    pub src_addr: SocketAddrV4,
    /// Destination (backend) address.
    pub dst_addr: SocketAddrV4,
}

impl ProxyProtocolV2 {
    /// Build a header for the given endpoints.
    ///
    /// IPv4-mapped IPv6 addresses are unwrapped; any other IPv6 address is
    /// rejected since only the IPv4 layout is produced.
    pub fn new(
        transport: Transport,
        src_addr: SocketAddr,
        dst_addr: SocketAddr,
    ) -> Result<Self, ProxyHeaderError> {
        Ok(Self {
            transport,
            src_addr: to_v4(src_addr)?,
            dst_addr: to_v4(dst_addr)?,
        })
    }

    /// Generate the header bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);

        buf.extend_from_slice(&PROXY_V2_SIGNATURE);
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(self.transport.protocol_byte());
        buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());

        buf.extend_from_slice(&self.src_addr.ip().octets());
        buf.extend_from_slice(&self.dst_addr.ip().octets());
        buf.extend_from_slice(&self.src_addr.port().to_be_bytes());
        buf.extend_from_slice(&self.dst_addr.port().to_be_bytes());

        buf
    }

    /// Encode `payload` with this header in front of it.
    pub fn prepend_to(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = self.encode();
        buf.extend_from_slice(payload);
        buf
    }
}

/// Encode a header in one call.
pub fn encode_v2(
    transport: Transport,
    client: SocketAddr,
    server: SocketAddr,
) -> Result<Vec<u8>, ProxyHeaderError> {
    ProxyProtocolV2::new(transport, client, server).map(|header| header.encode())
}

fn to_v4(addr: SocketAddr) -> Result<SocketAddrV4, ProxyHeaderError> {
    match addr.ip() {
        IpAddr::V4(ip) => Ok(SocketAddrV4::new(ip, addr.port())),
        IpAddr::V6(ip) => extract_v4_from_v6(ip)
            .map(|ip| SocketAddrV4::new(ip, addr.port()))
            .ok_or(ProxyHeaderError::UnsupportedAddress(addr)),
    }
}

/// Extract IPv4 from an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`).
fn extract_v4_from_v6(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = addr.octets();
    if octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xff && octets[11] == 0xff {
        return Some(Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ));
    }
    None
}

/// Parse a PROXY v2 header from a buffer.
///
/// Returns the parsed header and the number of bytes consumed,
/// or None if the buffer doesn't start with a valid IPv4 header.
pub fn parse_proxy_v2(data: &[u8]) -> Option<(ProxyProtocolV2, usize)> {
    if data.len() < 16 || data[..12] != PROXY_V2_SIGNATURE {
        return None;
    }

    if data[12] != VERSION_COMMAND_PROXY {
        return None;
    }
    let transport = Transport::from_protocol_byte(data[13])?;

    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if addr_len < IPV4_ADDR_LEN as usize || data.len() < 16 + addr_len {
        return None;
    }

    let src_ip = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let dst_ip = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
    let src_port = u16::from_be_bytes([data[24], data[25]]);
    let dst_port = u16::from_be_bytes([data[26], data[27]]);

    Some((
        ProxyProtocolV2 {
            transport,
            src_addr: SocketAddrV4::new(src_ip, src_port),
            dst_addr: SocketAddrV4::new(dst_ip, dst_port),
        },
        16 + addr_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_tcp_layout() {
        let encoded = encode_v2(
            Transport::Tcp,
            "192.168.1.1:12345".parse().unwrap(),
            "10.0.0.5:9100".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(
            &encoded[..16],
            &[
                0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a, 0x21,
                0x11, 0x00, 0x0c
            ]
        );
        assert_eq!(&encoded[16..20], &[192, 168, 1, 1]);
        assert_eq!(&encoded[20..24], &[0x0a, 0x00, 0x00, 0x05]);
        assert_eq!(&encoded[24..26], &12345u16.to_be_bytes());
        assert_eq!(&encoded[26..28], &[0x23, 0x8c]);
    }

    #[test]
    fn test_encode_udp_protocol_byte() {
        let encoded = encode_v2(
            Transport::Udp,
            "1.2.3.4:1".parse().unwrap(),
            "5.6.7.8:2".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(encoded[13], 0x12);
    }

    #[test]
    fn test_mapped_v6_is_unwrapped() {
        let header = ProxyProtocolV2::new(
            Transport::Tcp,
            "[::ffff:192.168.1.1]:4000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(header.src_addr, "192.168.1.1:4000".parse().unwrap());
    }

    #[test]
    fn test_native_v6_rejected() {
        let addr: SocketAddr = "[2001:db8::1]:12345".parse().unwrap();
        let err = encode_v2(Transport::Tcp, addr, "10.0.0.1:443".parse().unwrap()).unwrap_err();
        assert_eq!(err, ProxyHeaderError::UnsupportedAddress(addr));
    }

    #[test]
    fn test_prepend_keeps_payload() {
        let header = ProxyProtocolV2::new(
            Transport::Udp,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
        )
        .unwrap();
        let packet = header.prepend_to(b"\x01ping");
        let (parsed, consumed) = parse_proxy_v2(&packet).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&packet[consumed..], b"\x01ping");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_proxy_v2(&[0; 10]).is_none());

        let mut bad_sig = vec![0; 28];
        bad_sig[14] = 0;
        bad_sig[15] = 12;
        assert!(parse_proxy_v2(&bad_sig).is_none());

        let mut truncated = encode_v2(
            Transport::Tcp,
            "1.1.1.1:1".parse().unwrap(),
            "2.2.2.2:2".parse().unwrap(),
        )
        .unwrap();
        truncated.truncate(20);
        assert!(parse_proxy_v2(&truncated).is_none());
    }

    proptest! {
        #[test]
        fn roundtrip_recovers_endpoints(
            src in any::<[u8; 4]>(),
            dst in any::<[u8; 4]>(),
            src_port in any::<u16>(),
            dst_port in any::<u16>(),
            udp in any::<bool>(),
        ) {
            let transport = if udp { Transport::Udp } else { Transport::Tcp };
            let client = SocketAddr::from((Ipv4Addr::from(src), src_port));
            let server = SocketAddr::from((Ipv4Addr::from(dst), dst_port));

            let encoded = encode_v2(transport, client, server).unwrap();
            let (parsed, consumed) = parse_proxy_v2(&encoded).unwrap();

            prop_assert_eq!(consumed, HEADER_LEN);
            prop_assert_eq!(parsed.transport, transport);
            prop_assert_eq!(SocketAddr::V4(parsed.src_addr), client);
            prop_assert_eq!(SocketAddr::V4(parsed.dst_addr), server);
        }
    }
}
