//! Devices seen while scanning, before any connection is made.

use std::time::SystemTime;
use uuid::Uuid;

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// One advertisement sighting as reported by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: u64,
    /// Empty when the peer did not advertise a name.
    pub local_name: String,
    pub is_connectable: bool,
    pub signal_strength: i16,
    pub timestamp: SystemTime,
    pub service_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub address: u64,
    pub formatted_address: String,
    pub name: String,
    pub is_paired: bool,
    pub is_connectable: bool,
    pub signal_strength: i16,
    pub last_seen: SystemTime,
    /// Union of every advertised service id, in first-seen order.
    pub service_uuids: Vec<Uuid>,
}

impl DiscoveredPeer {
    pub fn from_advertisement(adv: &Advertisement) -> Self {
        let mut peer = Self {
            address: adv.address,
            formatted_address: format_address(adv.address),
            name: UNKNOWN_DEVICE_NAME.to_string(),
            is_paired: false,
            is_connectable: false,
            signal_strength: adv.signal_strength,
            last_seen: adv.timestamp,
            service_uuids: Vec::new(),
        };
        peer.update(adv);
        peer
    }

    pub fn update(&mut self, adv: &Advertisement) {
        self.last_seen = adv.timestamp;
        self.is_connectable = adv.is_connectable;
        self.signal_strength = adv.signal_strength;

        if !adv.local_name.is_empty() {
            self.name = adv.local_name.clone();
        }

        for uuid in &adv.service_uuids {
            if !self.service_uuids.contains(uuid) {
                self.service_uuids.push(*uuid);
            }
        }
    }

    pub fn is_paired_or_connectable(&self) -> bool {
        self.is_paired || self.is_connectable
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

/// Peers seen during the current scan, keyed by address.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<DiscoveredPeer>,
    scanning: bool,
    has_first_scan: bool,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything from the previous scan.
    pub fn begin_scan(&mut self) {
        self.peers.clear();
        self.scanning = true;
        self.has_first_scan = true;
    }

    pub fn end_scan(&mut self) {
        self.scanning = false;
    }

    pub fn record(&mut self, adv: &Advertisement) -> &DiscoveredPeer {
        match self.peers.iter().position(|p| p.address == adv.address) {
            Some(index) => {
                self.peers[index].update(adv);
                &self.peers[index]
            }
            None => {
                self.peers.push(DiscoveredPeer::from_advertisement(adv));
                let last = self.peers.len() - 1;
                &self.peers[last]
            }
        }
    }

    pub fn mark_paired(&mut self, address: u64) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.address == address) {
            peer.is_paired = true;
        }
    }

    pub fn get(&self, address: u64) -> Option<&DiscoveredPeer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_scanning_and_empty(&self) -> bool {
        self.scanning && self.peers.is_empty()
    }

    pub fn is_idle_and_empty(&self) -> bool {
        self.has_first_scan && !self.scanning && self.peers.is_empty()
    }
}

/// `0x0011AABBCCDD` -> `00:11:AA:BB:CC:DD`
pub fn format_address(address: u64) -> String {
    let hex = format!("{:012X}", address & 0xFFFF_FFFF_FFFF);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Accepts `AA:BB:CC:DD:EE:FF`, `AABBCCDDEEFF` or `0xAABBCCDDEEFF`.
pub fn parse_address(text: &str) -> Option<u64> {
    let trimmed = text.trim();
    let digits: String = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    if digits.is_empty() || digits.len() > 12 {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn adv(address: u64, name: &str, services: &[u128], secs: u64) -> Advertisement {
        Advertisement {
            address,
            local_name: name.to_string(),
            is_connectable: true,
            signal_strength: -60,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            service_uuids: services.iter().map(|s| uuid(*s)).collect(),
        }
    }

    #[test]
    fn test_service_set_is_union_across_sightings() {
        let mut registry = PeerRegistry::new();
        registry.begin_scan();

        registry.record(&adv(0xA1, "", &[1], 1));
        registry.record(&adv(0xA1, "", &[1, 2], 2));
        registry.record(&adv(0xA1, "", &[3], 3));
        let peer = registry.record(&adv(0xA1, "", &[], 4));

        assert_eq!(peer.service_uuids, vec![uuid(1), uuid(2), uuid(3)]);
        assert_eq!(peer.last_seen, SystemTime::UNIX_EPOCH + Duration::from_secs(4));
        assert_eq!(registry.peers().len(), 1);
    }

    #[test]
    fn test_name_falls_back_and_is_kept() {
        let mut registry = PeerRegistry::new();
        registry.begin_scan();

        assert_eq!(registry.record(&adv(0xB2, "", &[], 1)).name, UNKNOWN_DEVICE_NAME);
        assert_eq!(registry.record(&adv(0xB2, "Astro Helper", &[], 2)).name, "Astro Helper");
        assert_eq!(registry.record(&adv(0xB2, "", &[], 3)).name, "Astro Helper");
    }

    #[test]
    fn test_new_scan_discards_peers() {
        let mut registry = PeerRegistry::new();
        assert!(!registry.is_idle_and_empty());

        registry.begin_scan();
        assert!(registry.is_scanning_and_empty());
        registry.record(&adv(0xC3, "cam", &[], 1));
        registry.mark_paired(0xC3);
        assert!(registry.get(0xC3).unwrap().is_paired_or_connectable());
        registry.end_scan();

        registry.begin_scan();
        assert!(registry.get(0xC3).is_none());
        registry.end_scan();
        assert!(registry.is_idle_and_empty());
    }

    #[test]
    fn test_address_formatting() {
        assert_eq!(format_address(0x0011_AABB_CCDD), "00:11:AA:BB:CC:DD");
        assert_eq!(parse_address("00:11:AA:BB:CC:DD"), Some(0x0011_AABB_CCDD));
        assert_eq!(parse_address("0xaabbccddeeff"), Some(0xAABB_CCDD_EEFF));
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_address("zz:11"), None);
        assert_eq!(parse_address("11:22:33:44:55:66:77"), None);
    }
}
