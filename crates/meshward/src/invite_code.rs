//! Invite-Code Codec: compact binary encoding of relay coordinates plus
//! a pairing or PAKE token, transcribed as hyphen-grouped base32.

use crate::errors::InviteCodeError;
use base32::Alphabet;
use std::net::Ipv4Addr;

const BASE32: Alphabet = Alphabet::Rfc4648 { padding: false };
const MAX_NAMESPACE_LEN: usize = 63;
const HIGHEST_KNOWN_VERSION: u8 = 2;

/// V1: peer-to-peer PAKE invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakeInvite {
    pub pake_token: [u8; 8],
    pub relay_addr: Ipv4Addr,
    pub relay_port: u16,
    pub relay_peer_id: Vec<u8>,
    pub namespace: Vec<u8>,
    pub inviter_peer_id: Vec<u8>,
}

/// V2: relay-mediated pairing invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInvite {
    pub pairing_token: [u8; 16],
    pub relay_addr: Ipv4Addr,
    pub relay_port: u16,
    pub relay_peer_id: Vec<u8>,
    pub namespace: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteCode {
    Pake(PakeInvite),
    Pairing(PairingInvite),
}

/// Parses and validates the shape of a multihash: `[varint code][varint
/// length][digest]`, with no bytes left over after the digest.
fn validate_multihash(bytes: &[u8]) -> Result<(), InviteCodeError> {
    let (_, rest) = read_varint(bytes).ok_or_else(|| InviteCodeError::Malformed("peer id: missing multihash code".into()))?;
    let (len, rest) = read_varint(rest).ok_or_else(|| InviteCodeError::Malformed("peer id: missing multihash length".into()))?;
    let len = usize::try_from(len).map_err(|_| InviteCodeError::Malformed("peer id: length overflow".into()))?;
    if rest.len() != len {
        return Err(InviteCodeError::Malformed(
            "peer id: trailing bytes after multihash digest".into(),
        ));
    }
    Ok(())
}

fn read_varint(buf: &[u8]) -> Option<(u64, &[u8])> {
    let mut value: u64 = 0;
    let mut shift = 0_u32;
    for (i, &byte) in buf.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, &buf[i + 1..]));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn group_with_hyphens(s: &str) -> String {
    s.as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

fn normalize_outer(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace() && *c != '-').collect::<String>().to_uppercase()
}

impl InviteCode {
    #[must_use]
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        match self {
            Self::Pake(invite) => {
                buf.push(1_u8);
                buf.extend_from_slice(&invite.pake_token);
                buf.extend_from_slice(&invite.relay_addr.octets());
                buf.extend_from_slice(&invite.relay_port.to_be_bytes());
                push_length_prefixed(&mut buf, &invite.relay_peer_id);
                push_length_prefixed(&mut buf, &invite.namespace);
                buf.extend_from_slice(&invite.inviter_peer_id);
            }
            Self::Pairing(invite) => {
                buf.push(2_u8);
                buf.extend_from_slice(&invite.pairing_token);
                buf.extend_from_slice(&invite.relay_addr.octets());
                buf.extend_from_slice(&invite.relay_port.to_be_bytes());
                push_length_prefixed(&mut buf, &invite.relay_peer_id);
                push_length_prefixed(&mut buf, &invite.namespace);
            }
        }
        group_with_hyphens(&base32::encode(BASE32, &buf))
    }

    pub fn decode(s: &str) -> Result<Self, InviteCodeError> {
        let normalized = normalize_outer(s);
        let buf = base32::decode(BASE32, &normalized)
            .ok_or_else(|| InviteCodeError::Malformed("invalid base32".into()))?;

        let &version = buf
            .first()
            .ok_or_else(|| InviteCodeError::Malformed("empty invite code".into()))?;

        match version {
            1 => decode_pake(&buf[1..]).map(Self::Pake),
            2 => decode_pairing(&buf[1..]).map(Self::Pairing),
            v if v > HIGHEST_KNOWN_VERSION => Err(InviteCodeError::NewerVersion(v)),
            v => Err(InviteCodeError::UnsupportedVersion(v)),
        }
    }
}

fn push_length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

fn take<'a>(buf: &'a [u8], n: usize, what: &str) -> Result<(&'a [u8], &'a [u8]), InviteCodeError> {
    if buf.len() < n {
        return Err(InviteCodeError::Malformed(format!("truncated {what}")));
    }
    Ok(buf.split_at(n))
}

fn take_length_prefixed<'a>(buf: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8]), InviteCodeError> {
    let (len_byte, rest) = take(buf, 1, &format!("{what} length"))?;
    let len = usize::from(len_byte[0]);
    take(rest, len, what)
}

fn decode_pake(buf: &[u8]) -> Result<PakeInvite, InviteCodeError> {
    let (token_bytes, rest) = take(buf, 8, "PAKE token")?;
    let mut pake_token = [0_u8; 8];
    pake_token.copy_from_slice(token_bytes);

    let (addr_bytes, rest) = take(rest, 4, "relay address")?;
    let relay_addr = Ipv4Addr::new(addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3]);

    let (port_bytes, rest) = take(rest, 2, "relay port")?;
    let relay_port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let (relay_peer_id, rest) = take_length_prefixed(rest, "relay peer id")?;
    validate_multihash(relay_peer_id)?;

    let (namespace, rest) = take_length_prefixed(rest, "namespace")?;
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(InviteCodeError::Malformed("namespace exceeds 63 bytes".into()));
    }

    if rest.is_empty() {
        return Err(InviteCodeError::Malformed("missing inviter peer id".into()));
    }
    validate_multihash(rest)?;

    Ok(PakeInvite {
        pake_token,
        relay_addr,
        relay_port,
        relay_peer_id: relay_peer_id.to_vec(),
        namespace: namespace.to_vec(),
        inviter_peer_id: rest.to_vec(),
    })
}

fn decode_pairing(buf: &[u8]) -> Result<PairingInvite, InviteCodeError> {
    let (token_bytes, rest) = take(buf, 16, "pairing token")?;
    let mut pairing_token = [0_u8; 16];
    pairing_token.copy_from_slice(token_bytes);

    let (addr_bytes, rest) = take(rest, 4, "relay address")?;
    let relay_addr = Ipv4Addr::new(addr_bytes[0], addr_bytes[1], addr_bytes[2], addr_bytes[3]);

    let (port_bytes, rest) = take(rest, 2, "relay port")?;
    let relay_port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let (relay_peer_id, rest) = take_length_prefixed(rest, "relay peer id")?;
    validate_multihash(relay_peer_id)?;

    let (namespace, rest) = take_length_prefixed(rest, "namespace")?;
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(InviteCodeError::Malformed("namespace exceeds 63 bytes".into()));
    }

    if !rest.is_empty() {
        return Err(InviteCodeError::Malformed("trailing bytes after namespace".into()));
    }

    Ok(PairingInvite {
        pairing_token,
        relay_addr,
        relay_port,
        relay_peer_id: relay_peer_id.to_vec(),
        namespace: namespace.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_multihash(digest: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(0x12, &mut buf);
        write_varint(digest.len() as u64, &mut buf);
        buf.extend_from_slice(digest);
        buf
    }

    #[test]
    fn pairing_invite_round_trips() {
        let invite = PairingInvite {
            pairing_token: [7_u8; 16],
            relay_addr: Ipv4Addr::new(203, 0, 113, 5),
            relay_port: 4001,
            relay_peer_id: test_multihash(b"relaypeeriddigest"),
            namespace: b"home".to_vec(),
        };
        let code = InviteCode::Pairing(invite.clone());
        let encoded = code.encode();
        assert!(encoded.contains('-'));
        let decoded = InviteCode::decode(&encoded).unwrap();
        assert_eq!(decoded, InviteCode::Pairing(invite));
    }

    #[test]
    fn pake_invite_round_trips() {
        let invite = PakeInvite {
            pake_token: [3_u8; 8],
            relay_addr: Ipv4Addr::new(198, 51, 100, 9),
            relay_port: 9000,
            relay_peer_id: test_multihash(b"relaydigest"),
            namespace: Vec::new(),
            inviter_peer_id: test_multihash(b"inviterdigest"),
        };
        let code = InviteCode::Pake(invite.clone());
        let decoded = InviteCode::decode(&code.encode()).unwrap();
        assert_eq!(decoded, InviteCode::Pake(invite));
    }

    #[test]
    fn decode_ignores_hyphens_whitespace_and_case() {
        let invite = PairingInvite {
            pairing_token: [1_u8; 16],
            relay_addr: Ipv4Addr::LOCALHOST,
            relay_port: 1,
            relay_peer_id: test_multihash(b"x"),
            namespace: Vec::new(),
        };
        let encoded = InviteCode::Pairing(invite.clone()).encode();
        let mangled = format!("  {} \n", encoded.to_lowercase());
        assert_eq!(InviteCode::decode(&mangled).unwrap(), InviteCode::Pairing(invite));
    }

    #[test]
    fn v2_rejects_trailing_junk() {
        let invite = PairingInvite {
            pairing_token: [1_u8; 16],
            relay_addr: Ipv4Addr::LOCALHOST,
            relay_port: 1,
            relay_peer_id: test_multihash(b"x"),
            namespace: Vec::new(),
        };
        let mut buf = Vec::new();
        buf.push(2_u8);
        buf.extend_from_slice(&invite.pairing_token);
        buf.extend_from_slice(&invite.relay_addr.octets());
        buf.extend_from_slice(&invite.relay_port.to_be_bytes());
        push_length_prefixed(&mut buf, &invite.relay_peer_id);
        push_length_prefixed(&mut buf, &invite.namespace);
        buf.push(0xff);
        let encoded = group_with_hyphens(&base32::encode(BASE32, &buf));
        assert!(matches!(
            InviteCode::decode(&encoded),
            Err(InviteCodeError::Malformed(_))
        ));
    }

    #[test]
    fn namespace_over_limit_is_rejected() {
        let mut namespace = vec![b'a'; MAX_NAMESPACE_LEN + 1];
        let mut buf = Vec::new();
        buf.push(2_u8);
        buf.extend_from_slice(&[0_u8; 16]);
        buf.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        let peer_id = test_multihash(b"x");
        push_length_prefixed(&mut buf, &peer_id);
        namespace.truncate(MAX_NAMESPACE_LEN + 1);
        push_length_prefixed(&mut buf, &namespace);
        let encoded = group_with_hyphens(&base32::encode(BASE32, &buf));
        assert!(matches!(
            InviteCode::decode(&encoded),
            Err(InviteCodeError::Malformed(_))
        ));
    }

    #[test]
    fn newer_version_is_a_distinct_error() {
        let buf = vec![0xfe_u8];
        let encoded = group_with_hyphens(&base32::encode(BASE32, &buf));
        assert!(matches!(
            InviteCode::decode(&encoded),
            Err(InviteCodeError::NewerVersion(0xfe))
        ));
    }

    #[test]
    fn malformed_multihash_trailing_bytes_rejected() {
        let mut peer_id = test_multihash(b"x");
        peer_id.push(0xaa);
        let mut buf = Vec::new();
        buf.push(2_u8);
        buf.extend_from_slice(&[0_u8; 16]);
        buf.extend_from_slice(&Ipv4Addr::LOCALHOST.octets());
        buf.extend_from_slice(&1_u16.to_be_bytes());
        push_length_prefixed(&mut buf, &peer_id);
        push_length_prefixed(&mut buf, &[]);
        let encoded = group_with_hyphens(&base32::encode(BASE32, &buf));
        assert!(matches!(
            InviteCode::decode(&encoded),
            Err(InviteCodeError::Malformed(_))
        ));
    }
}
