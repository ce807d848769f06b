//! Discovered-address storage with seeded bucket placement.
//!
//! Two tables: `new` holds addresses we have heard about but never connected
//! to, `tried` holds addresses that completed a connection at least once.
//! Bucket assignment is deterministic per node secret, which caps how much of
//! either table a single network group can occupy.

use crate::addr::{bucket_id, normalize_address};
use crate::config::{P2PConfig, PeerLists};
use crate::error::P2PError;
use crate::types::{PeerId, PeerInfo, PeerKind};
use std::collections::HashMap;

pub struct PeerBook {
    secret: u32,
    new_bucket_count: u32,
    new_bucket_size: usize,
    tried_bucket_count: u32,
    tried_bucket_size: usize,
    /// Bucket vectors keep insertion order; a full bucket evicts its oldest
    /// entry.
    new_buckets: Vec<Vec<PeerInfo>>,
    tried_buckets: Vec<Vec<PeerInfo>>,
    index: HashMap<PeerId, (PeerKind, u32)>,
}

/// Table occupancy counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerBookStats {
    pub new: usize,
    pub tried: usize,
}

impl PeerBook {
    pub fn new(config: &P2PConfig) -> Self {
        Self {
            secret: config.secret,
            new_bucket_count: config.new_bucket_count,
            new_bucket_size: config.new_bucket_size,
            tried_bucket_count: config.tried_bucket_count,
            tried_bucket_size: config.tried_bucket_size,
            new_buckets: vec![Vec::new(); config.new_bucket_count as usize],
            tried_buckets: vec![Vec::new(); config.tried_bucket_count as usize],
            index: HashMap::new(),
        }
    }

    /// Insert a peer into the new table. Returns false when the id is
    /// already known in either table.
    pub fn add_new(&mut self, peer_info: PeerInfo) -> Result<bool, P2PError> {
        let peer_id = peer_info.peer_id();
        if self.index.contains_key(&peer_id) {
            return Ok(false);
        }

        let bucket = bucket_id(
            self.secret,
            PeerKind::New,
            &peer_info.ip_address,
            self.new_bucket_count,
        )?;
        let slot = &mut self.new_buckets[bucket as usize];
        if slot.len() >= self.new_bucket_size {
            let evicted = slot.remove(0);
            self.index.remove(&evicted.peer_id());
        }
        slot.push(peer_info);
        self.index.insert(peer_id, (PeerKind::New, bucket));
        Ok(true)
    }

    /// Insert a peer directly into the tried table. Returns false when the
    /// id is already known in either table.
    pub fn add_tried(&mut self, peer_info: PeerInfo) -> Result<bool, P2PError> {
        let peer_id = peer_info.peer_id();
        if self.index.contains_key(&peer_id) {
            return Ok(false);
        }

        let bucket = bucket_id(
            self.secret,
            PeerKind::Tried,
            &peer_info.ip_address,
            self.tried_bucket_count,
        )?;
        let slot = &mut self.tried_buckets[bucket as usize];
        if slot.len() >= self.tried_bucket_size {
            let evicted = slot.remove(0);
            self.index.remove(&evicted.peer_id());
        }
        slot.push(peer_info);
        self.index.insert(peer_id, (PeerKind::Tried, bucket));
        Ok(true)
    }

    /// Move a peer from the new table to the tried table after a successful
    /// connection. No-op when the peer is unknown or already tried.
    pub fn upgrade_new_to_tried(&mut self, peer_id: &str) -> Result<(), P2PError> {
        let Some(&(PeerKind::New, bucket)) = self.index.get(peer_id) else {
            return Ok(());
        };

        let slot = &mut self.new_buckets[bucket as usize];
        let Some(pos) = slot.iter().position(|p| p.peer_id() == peer_id) else {
            return Ok(());
        };
        let info = slot.remove(pos);
        self.index.remove(peer_id);
        self.add_tried(info)?;
        Ok(())
    }

    /// Remove a peer from whichever table holds it.
    pub fn remove(&mut self, peer_id: &str) {
        let Some((kind, bucket)) = self.index.remove(peer_id) else {
            return;
        };
        let slot = match kind {
            PeerKind::New => &mut self.new_buckets[bucket as usize],
            PeerKind::Tried => &mut self.tried_buckets[bucket as usize],
        };
        slot.retain(|p| p.peer_id() != peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.index.contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerInfo> {
        let &(kind, bucket) = self.index.get(peer_id)?;
        let slot = match kind {
            PeerKind::New => &self.new_buckets[bucket as usize],
            PeerKind::Tried => &self.tried_buckets[bucket as usize],
        };
        slot.iter().find(|p| p.peer_id() == peer_id)
    }

    /// Every peer across both tables.
    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        self.new_buckets
            .iter()
            .chain(self.tried_buckets.iter())
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }

    pub fn new_peers(&self) -> Vec<PeerInfo> {
        self.new_buckets.iter().flat_map(|b| b.iter().cloned()).collect()
    }

    pub fn tried_peers(&self) -> Vec<PeerInfo> {
        self.tried_buckets.iter().flat_map(|b| b.iter().cloned()).collect()
    }

    pub fn get_bucket(&self, kind: PeerKind, id: u32) -> Option<&[PeerInfo]> {
        let buckets = match kind {
            PeerKind::New => &self.new_buckets,
            PeerKind::Tried => &self.tried_buckets,
        };
        buckets.get(id as usize).map(Vec::as_slice)
    }

    pub fn stats(&self) -> PeerBookStats {
        PeerBookStats {
            new: self.new_buckets.iter().map(Vec::len).sum(),
            tried: self.tried_buckets.iter().map(Vec::len).sum(),
        }
    }
}

/// Filter and normalize the statically configured peer lists.
///
/// All addresses are normalized, blacklisted IPs are removed from every
/// list, and whitelist entries that also appear among fixed or seed peers
/// are dropped from the whitelist.
pub fn sanitize_peer_lists(lists: &PeerLists, blacklisted_ips: &[String]) -> PeerLists {
    let blacklist: Vec<String> = blacklisted_ips
        .iter()
        .filter_map(|ip| normalize_address(ip).ok().map(|n| n.address))
        .collect();

    let sanitize = |peers: &[PeerInfo]| -> Vec<PeerInfo> {
        peers
            .iter()
            .filter_map(|peer| {
                let normalized = normalize_address(&peer.ip_address).ok()?;
                if blacklist.contains(&normalized.address) {
                    return None;
                }
                let mut peer = peer.clone();
                peer.ip_address = normalized.address;
                Some(peer)
            })
            .collect()
    };

    let seed_peers = sanitize(&lists.seed_peers);
    let fixed_peers = sanitize(&lists.fixed_peers);
    let previous_peers = sanitize(&lists.previous_peers);

    let pinned: Vec<PeerId> = seed_peers
        .iter()
        .chain(fixed_peers.iter())
        .map(PeerInfo::peer_id)
        .collect();
    let whitelisted = sanitize(&lists.whitelisted)
        .into_iter()
        .filter(|peer| !pinned.contains(&peer.peer_id()))
        .collect();

    PeerLists { seed_peers, fixed_peers, whitelisted, previous_peers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn peer(ip: &str, port: u16) -> PeerInfo {
        PeerInfo {
            ip_address: ip.to_string(),
            ws_port: port,
            version: "1.0.0".into(),
            protocol_version: Some("1.0".into()),
            os: String::new(),
            height: 0,
            extras: Map::new(),
        }
    }

    fn book() -> PeerBook {
        let mut config = P2PConfig::default();
        config.secret = 42;
        PeerBook::new(&config)
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut book = book();
        assert!(book.add_new(peer("203.0.113.7", 5001)).unwrap());
        assert!(!book.add_new(peer("203.0.113.7", 5001)).unwrap());
        assert_eq!(book.stats(), PeerBookStats { new: 1, tried: 0 });
    }

    #[test]
    fn test_upgrade_new_to_tried() {
        let mut book = book();
        book.add_new(peer("203.0.113.7", 5001)).unwrap();
        book.upgrade_new_to_tried("203.0.113.7:5001").unwrap();
        assert_eq!(book.stats(), PeerBookStats { new: 0, tried: 1 });
        assert!(book.contains("203.0.113.7:5001"));

        // Upgrading again is a no-op
        book.upgrade_new_to_tried("203.0.113.7:5001").unwrap();
        assert_eq!(book.stats(), PeerBookStats { new: 0, tried: 1 });
    }

    #[test]
    fn test_remove() {
        let mut book = book();
        book.add_new(peer("203.0.113.7", 5001)).unwrap();
        book.remove("203.0.113.7:5001");
        assert!(!book.contains("203.0.113.7:5001"));
        assert_eq!(book.stats(), PeerBookStats { new: 0, tried: 0 });
    }

    #[test]
    fn test_full_bucket_evicts_oldest() {
        let mut config = P2PConfig::default();
        config.secret = 42;
        config.new_bucket_count = 1;
        config.new_bucket_size = 2;
        let mut book = PeerBook::new(&config);

        book.add_new(peer("203.0.113.1", 5001)).unwrap();
        book.add_new(peer("203.0.113.2", 5001)).unwrap();
        book.add_new(peer("203.0.113.3", 5001)).unwrap();

        assert_eq!(book.stats().new, 2);
        assert!(!book.contains("203.0.113.1:5001"));
        assert!(book.contains("203.0.113.3:5001"));
    }

    #[test]
    fn test_get_bucket_placement() {
        let mut book = book();
        let info = peer("203.0.113.7", 5001);
        let bucket = bucket_id(42, PeerKind::New, "203.0.113.7", 128).unwrap();
        book.add_new(info).unwrap();

        let slot = book.get_bucket(PeerKind::New, bucket).unwrap();
        assert_eq!(slot.len(), 1);
        assert_eq!(slot[0].peer_id(), "203.0.113.7:5001");
    }

    #[test]
    fn test_rejects_unroutable_garbage() {
        let mut book = book();
        let mut bad = peer("203.0.113.7", 5001);
        bad.ip_address = "not-an-ip".into();
        assert!(book.add_new(bad).is_err());
    }

    #[test]
    fn test_sanitize_peer_lists() {
        let lists = PeerLists {
            seed_peers: vec![peer("203.0.113.7", 5001), peer("198.51.100.1", 5002)],
            fixed_peers: vec![peer("::ffff:192.0.2.9", 5003)],
            whitelisted: vec![peer("203.0.113.7", 5001), peer("192.0.2.50", 5004)],
            previous_peers: vec![peer("198.51.100.1", 5002)],
        };
        let sanitized = sanitize_peer_lists(&lists, &["198.51.100.1".to_string()]);

        // Blacklisted everywhere
        assert_eq!(sanitized.seed_peers.len(), 1);
        assert!(sanitized.previous_peers.is_empty());

        // Mapped address normalized
        assert_eq!(sanitized.fixed_peers[0].ip_address, "192.0.2.9");

        // Whitelist entry duplicated in seeds dropped, the other kept
        assert_eq!(sanitized.whitelisted.len(), 1);
        assert_eq!(sanitized.whitelisted[0].ip_address, "192.0.2.50");
    }
}
