/// Peer devices as last reported by the local device.
///
/// The registry is only ever replaced wholesale from a status payload; there is
/// no local add or remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRegistry {
    peers: Vec<String>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the membership actually changed.
    pub fn replace(&mut self, names: Vec<String>) -> bool {
        if self.peers == names {
            return false;
        }
        self.peers = names;
        true
    }

    pub fn list(&self) -> &[String] {
        &self.peers
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.iter().any(|p| p == name)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
