//! Address normalization, network classification and bucket hashing.

use crate::error::P2PError;
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::PeerKind;

/// Network family of a peer address.
///
/// The discriminant doubles as the one-byte network code mixed into the
/// bucket hash, so it must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Network {
    Local = 0,
    Private = 1,
    Ipv4 = 2,
    Ipv6 = 3,
    Other = 4,
}

/// Address protocol family after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ipv4,
    Ipv6,
}

/// A textual address reduced to its canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    pub protocol: Protocol,
    pub address: String,
}

/// Normalize a textual IP address.
///
/// IPv4 passes through unchanged. An IPv4-mapped IPv6 address
/// (`::ffff:a.b.c.d`) unwraps to its dotted IPv4 form. Any other IPv6
/// address expands `::`, lowercases, and strips leading zeros per group,
/// e.g. `::1` becomes `0:0:0:0:0:0:0:1`.
pub fn normalize_address(address: &str) -> Result<NormalizedAddress, P2PError> {
    if address.parse::<Ipv4Addr>().is_ok() {
        return Ok(NormalizedAddress {
            protocol: Protocol::Ipv4,
            address: address.to_string(),
        });
    }

    let ip: Ipv6Addr = address
        .parse()
        .map_err(|_| P2PError::UnsupportedAddress(address.to_string()))?;

    if let Some(v4) = ip.to_ipv4_mapped() {
        return Ok(NormalizedAddress {
            protocol: Protocol::Ipv4,
            address: v4.to_string(),
        });
    }

    let groups: Vec<String> = ip.segments().iter().map(|s| format!("{s:x}")).collect();
    Ok(NormalizedAddress {
        protocol: Protocol::Ipv6,
        address: groups.join(":"),
    })
}

/// Classify an address into its network family.
///
/// Local: IPv4 first octet 0 or 127, or the IPv6 loopback. Private: IPv4
/// 10.x or 172.[16..=31].x, or IPv6 fc00::/8 and fd00::/8. Anything that
/// does not parse is `Other`.
pub fn classify_network(address: &str) -> Network {
    let Ok(normalized) = normalize_address(address) else {
        return Network::Other;
    };

    match normalized.protocol {
        Protocol::Ipv4 => {
            let Ok(ip) = normalized.address.parse::<Ipv4Addr>() else {
                return Network::Other;
            };
            let octets = ip.octets();
            match octets[0] {
                0 | 127 => Network::Local,
                10 => Network::Private,
                172 if (16..=31).contains(&octets[1]) => Network::Private,
                _ => Network::Ipv4,
            }
        }
        Protocol::Ipv6 => {
            let Ok(ip) = normalized.address.parse::<Ipv6Addr>() else {
                return Network::Other;
            };
            if ip.is_loopback() {
                return Network::Local;
            }
            let first_byte = (ip.segments()[0] >> 8) as u8;
            if first_byte == 0xfc || first_byte == 0xfd {
                return Network::Private;
            }
            Network::Ipv6
        }
    }
}

/// Format the canonical peer id for an address and port.
///
/// IPv4: `"<ip>:<port>"`. IPv6: `"[<ip>]:<port>"` with the address in its
/// uncompressed normalized form.
pub fn peer_id(ip_address: &str, port: u16) -> String {
    if ip_address.contains(':') {
        format!("[{ip_address}]:{port}")
    } else {
        format!("{ip_address}:{port}")
    }
}

/// Deterministically assign an address to a bucket.
///
/// Hashes `secret(4, big-endian) || network_code(1) || address_bytes` with
/// SHA-256 and reduces the first four bytes modulo `bucket_count`. The
/// node-private `secret` keeps an adversary from precomputing addresses
/// that collide into a victim's bucket.
///
/// Local and private addresses omit the address bytes entirely, so they all
/// share one bucket per secret and kind. For the new table the address bytes
/// are truncated to the network group (first two octets for IPv4, first two
/// groups for IPv6): filling many new buckets then requires addresses in
/// many distinct groups, not just many addresses.
pub fn bucket_id(
    secret: u32,
    kind: PeerKind,
    target_address: &str,
    bucket_count: u32,
) -> Result<u32, P2PError> {
    let normalized = normalize_address(target_address)?;
    let network = classify_network(&normalized.address);

    let mut bytes = Vec::with_capacity(21);
    bytes.extend_from_slice(&secret.to_be_bytes());
    bytes.push(network as u8);

    match network {
        Network::Local | Network::Private => {}
        Network::Ipv4 => {
            let ip: Ipv4Addr = normalized
                .address
                .parse()
                .map_err(|_| P2PError::UnsupportedAddress(target_address.to_string()))?;
            let octets = ip.octets();
            match kind {
                PeerKind::New => bytes.extend_from_slice(&octets[..2]),
                PeerKind::Tried => bytes.extend_from_slice(&octets),
            }
        }
        Network::Ipv6 => {
            let ip: Ipv6Addr = normalized
                .address
                .parse()
                .map_err(|_| P2PError::UnsupportedAddress(target_address.to_string()))?;
            let octets = ip.octets();
            match kind {
                PeerKind::New => bytes.extend_from_slice(&octets[..4]),
                PeerKind::Tried => bytes.extend_from_slice(&octets),
            }
        }
        Network::Other => {
            return Err(P2PError::UnsupportedAddress(target_address.to_string()));
        }
    }

    let digest = Sha256::digest(&bytes);
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(head % bucket_count)
}
