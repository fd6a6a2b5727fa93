//! Tunnel handshake header.
//!
//! Wire layout (all multi-byte integers big-endian):
//!
//! ```text
//! +---------+------------+---------+-----------+-----------------+--------+---------
//! | version | credential | command | addr kind | address         | port   | payload
//! | 1       | 16         | 1       | 1         | 4 / 1+len / 16  | 2      | ...
//! +---------+------------+---------+-----------+-----------------+--------+---------
//! ```
//!
//! The server never answers the header; a successful handshake is only visible to
//! the client as target bytes starting to flow back.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::conduit::credential::{CREDENTIAL_LEN, Credential};

const CMD_TCP: u8 = 1;

const ADDR_IPV4: u8 = 1;
const ADDR_DOMAIN: u8 = 2;
const ADDR_IPV6: u8 = 3;

pub const MAX_DOMAIN_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address kind {0}")]
    UnsupportedAddressKind(u8),
    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),
}

impl HeaderError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HeaderError::AuthenticationFailed => "auth",
            HeaderError::UnsupportedCommand(_) => "command",
            HeaderError::UnsupportedAddressKind(_) => "address_kind",
            HeaderError::DomainTooLong(_) => "domain_len",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{ip}"),
            Address::Domain(d) => f.write_str(d),
            // Full form: eight zero-padded groups, never `::` compressed.
            Address::Ipv6(ip) => {
                for (i, seg) in ip.segments().iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{seg:04x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u8,
    pub command: Command,
    pub address: Address,
    pub port: u16,
    /// Bytes that arrived after the header; forwarded to the target first.
    pub trailing_payload: Bytes,
}

impl ConnectRequest {
    pub fn destination(&self) -> String {
        match &self.address {
            Address::Ipv6(_) => format!("[{}]:{}", self.address, self.port),
            other => format!("{}:{}", other, self.port),
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

/// Decodes a handshake header from the bytes accumulated so far.
///
/// Returns `Ok(None)` while the buffer is too short for the next field. The
/// input is never modified, so the caller may append more bytes and call again.
/// On success the consumed byte count is returned alongside the request, and
/// everything after it is copied into `trailing_payload`.
pub fn parse_header(
    buf: &[u8],
    credential: &Credential,
) -> Result<Option<(ConnectRequest, usize)>, HeaderError> {
    let mut cur = Cursor::new(buf);

    let Some(version) = cur.u8() else {
        return Ok(None);
    };

    let Some(presented) = cur.take(CREDENTIAL_LEN) else {
        return Ok(None);
    };
    if !credential.matches(presented) {
        return Err(HeaderError::AuthenticationFailed);
    }

    let Some(cmd) = cur.u8() else {
        return Ok(None);
    };
    let command = match cmd {
        CMD_TCP => Command::Tcp,
        other => return Err(HeaderError::UnsupportedCommand(other)),
    };

    let Some(kind) = cur.u8() else {
        return Ok(None);
    };
    let address = match kind {
        ADDR_IPV4 => {
            let Some(b) = cur.take(4) else {
                return Ok(None);
            };
            Address::Ipv4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        ADDR_DOMAIN => {
            let Some(len) = cur.u8() else {
                return Ok(None);
            };
            let Some(b) = cur.take(len as usize) else {
                return Ok(None);
            };
            Address::Domain(String::from_utf8_lossy(b).into_owned())
        }
        ADDR_IPV6 => {
            let Some(b) = cur.take(16) else {
                return Ok(None);
            };
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        other => return Err(HeaderError::UnsupportedAddressKind(other)),
    };

    let Some(port) = cur.u16() else {
        return Ok(None);
    };

    let consumed = cur.pos;
    Ok(Some((
        ConnectRequest {
            version,
            command,
            address,
            port,
            trailing_payload: Bytes::copy_from_slice(&buf[consumed..]),
        },
        consumed,
    )))
}

/// Writes a TCP connect header in the layout accepted by [`parse_header`].
pub fn encode_header<B: BufMut>(
    out: &mut B,
    version: u8,
    credential: &Credential,
    address: &Address,
    port: u16,
) -> Result<(), HeaderError> {
    if let Address::Domain(d) = address {
        if d.len() > MAX_DOMAIN_LEN {
            return Err(HeaderError::DomainTooLong(d.len()));
        }
    }

    out.put_u8(version);
    out.put_slice(credential.as_bytes());
    out.put_u8(CMD_TCP);
    match address {
        Address::Ipv4(ip) => {
            out.put_u8(ADDR_IPV4);
            out.put_slice(&ip.octets());
        }
        Address::Domain(d) => {
            out.put_u8(ADDR_DOMAIN);
            out.put_u8(d.len() as u8);
            out.put_slice(d.as_bytes());
        }
        Address::Ipv6(ip) => {
            out.put_u8(ADDR_IPV6);
            out.put_slice(&ip.octets());
        }
    }
    out.put_u16(port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::dev_placeholder()
    }

    fn header(address: &Address, port: u16) -> Vec<u8> {
        let mut out = Vec::new();
        encode_header(&mut out, 0, &cred(), address, port).unwrap();
        out
    }

    #[test]
    fn ipv4_bytes_are_kept_verbatim() {
        let mut buf = header(&Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 443);
        buf.extend_from_slice(b"GET /");

        let (req, consumed) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(consumed, 1 + 16 + 1 + 1 + 4 + 2);
        assert_eq!(req.command, Command::Tcp);
        match req.address {
            Address::Ipv4(ip) => assert_eq!(ip.octets(), [1, 2, 3, 4]),
            other => panic!("unexpected address: {other:?}"),
        }
        assert_eq!(req.port, 443);
        assert_eq!(req.destination(), "1.2.3.4:443");
        assert_eq!(&req.trailing_payload[..], b"GET /");
    }

    #[test]
    fn ipv6_renders_eight_padded_groups() {
        let buf = header(&Address::Ipv6(Ipv6Addr::UNSPECIFIED), 80);
        let (req, _) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(
            req.address.to_string(),
            "0000:0000:0000:0000:0000:0000:0000:0000"
        );
        assert_eq!(
            req.destination(),
            "[0000:0000:0000:0000:0000:0000:0000:0000]:80"
        );

        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let buf = header(&Address::Ipv6(ip), 80);
        let (req, _) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(
            req.address.to_string(),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
        assert_eq!(req.address, Address::Ipv6(ip));
    }

    #[test]
    fn empty_domain_is_complete_not_incomplete() {
        let buf = header(&Address::Domain(String::new()), 8080);
        let (req, consumed) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(req.address, Address::Domain(String::new()));
        assert_eq!(consumed, buf.len());
        assert!(req.trailing_payload.is_empty());

        // Length byte present, port missing: still waiting.
        assert_eq!(parse_header(&buf[..buf.len() - 2], &cred()).unwrap(), None);
    }

    #[test]
    fn domain_is_read_by_length_prefix() {
        let mut buf = header(&Address::Domain("example.com".into()), 443);
        buf.extend_from_slice(&[0xde, 0xad]);
        let (req, consumed) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(req.address, Address::Domain("example.com".into()));
        assert_eq!(req.destination(), "example.com:443");
        assert_eq!(consumed, buf.len() - 2);
        assert_eq!(&req.trailing_payload[..], &[0xde, 0xad]);
    }

    #[test]
    fn every_prefix_is_incomplete() {
        let buf = header(&Address::Domain("a.example".into()), 1);
        for n in 0..buf.len() {
            assert_eq!(parse_header(&buf[..n], &cred()).unwrap(), None, "prefix {n}");
        }
    }

    #[test]
    fn fragmentation_does_not_change_the_result() {
        let mut wire = header(&Address::Domain("chunked.example".into()), 9000);
        wire.extend((0u8..=200).collect::<Vec<_>>());
        let (whole, whole_n) = parse_header(&wire, &cred()).unwrap().unwrap();

        // Feed one byte at a time, re-parsing the growing buffer like a session does.
        let mut acc = Vec::new();
        let mut got = None;
        for b in &wire {
            acc.push(*b);
            if let Some(done) = parse_header(&acc, &cred()).unwrap() {
                got = Some(done);
                break;
            }
        }
        let (one, one_n) = got.unwrap();
        assert_eq!(one_n, whole_n);
        assert_eq!(one.address, whole.address);
        assert_eq!(one.port, whole.port);
        // The byte-wise run completes the moment the port arrives, before any payload.
        assert!(one.trailing_payload.is_empty());

        // Splitting at arbitrary points after the header must keep the payload intact.
        for split in [whole_n, whole_n + 1, wire.len()] {
            let (r, n) = parse_header(&wire[..split], &cred()).unwrap().unwrap();
            assert_eq!(n, whole_n);
            assert_eq!(&r.trailing_payload[..], &wire[whole_n..split]);
        }
    }

    #[test]
    fn any_credential_byte_difference_is_rejected() {
        let good = header(&Address::Ipv4(Ipv4Addr::LOCALHOST), 22);
        for i in 1..=16 {
            let mut bad = good.clone();
            bad[i] = bad[i].wrapping_add(1);
            assert_eq!(
                parse_header(&bad, &cred()),
                Err(HeaderError::AuthenticationFailed),
                "credential byte {}",
                i - 1
            );
            // Rejected as soon as the credential is complete.
            assert_eq!(
                parse_header(&bad[..17], &cred()),
                Err(HeaderError::AuthenticationFailed)
            );
        }
    }

    #[test]
    fn unsupported_command_and_address_kind() {
        let mut buf = header(&Address::Ipv4(Ipv4Addr::LOCALHOST), 22);
        buf[17] = 2;
        assert_eq!(
            parse_header(&buf, &cred()),
            Err(HeaderError::UnsupportedCommand(2))
        );

        let mut buf = header(&Address::Ipv4(Ipv4Addr::LOCALHOST), 22);
        buf[18] = 4;
        assert_eq!(
            parse_header(&buf, &cred()),
            Err(HeaderError::UnsupportedAddressKind(4))
        );
        assert_eq!(
            parse_header(&buf[..19], &cred()),
            Err(HeaderError::UnsupportedAddressKind(4))
        );
    }

    #[test]
    fn version_is_recorded_not_validated() {
        let mut buf = header(&Address::Ipv4(Ipv4Addr::LOCALHOST), 22);
        buf[0] = 0x7f;
        let (req, _) = parse_header(&buf, &cred()).unwrap().unwrap();
        assert_eq!(req.version, 0x7f);
    }

    #[test]
    fn encode_rejects_long_domain() {
        let mut out = Vec::new();
        let long = "a".repeat(MAX_DOMAIN_LEN + 1);
        let err = encode_header(&mut out, 0, &cred(), &Address::Domain(long), 1).unwrap_err();
        assert_eq!(err, HeaderError::DomainTooLong(MAX_DOMAIN_LEN + 1));
        assert!(out.is_empty());
    }
}
