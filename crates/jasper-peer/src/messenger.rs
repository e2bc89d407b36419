//! The data-plane messenger seam.
//!
//! The control plane only needs one thing from the messenger: a locator for
//! each virtual peer, published in `add-virtual-peer` so other peers can
//! reach it. The locator is opaque here.

use jasper_types::{MessagingConfig, PeerId, PeerSite, Transport};

pub trait Messenger: Send + Sync + 'static {
    /// Returns the data-plane locator for a local virtual peer.
    fn peer_site(&self, peer: &PeerId) -> PeerSite;
}

/// Messenger for peers running in one process.
#[derive(Debug, Clone, Default)]
pub struct LocalMessenger {
    config: MessagingConfig,
}

impl LocalMessenger {
    pub fn new(config: MessagingConfig) -> Self {
        Self { config }
    }
}

impl Messenger for LocalMessenger {
    fn peer_site(&self, peer: &PeerId) -> PeerSite {
        match (&self.config.transport, &self.config.bind_address) {
            (Transport::Tcp, Some(address)) => PeerSite::new(format!("tcp://{address}/{peer}")),
            _ => PeerSite::new(format!("local://{peer}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_sites_name_the_peer() {
        let messenger = LocalMessenger::default();
        assert_eq!(
            messenger.peer_site(&PeerId::new("p1")),
            PeerSite::new("local://p1")
        );
    }

    #[test]
    fn tcp_sites_include_the_bind_address() {
        let messenger = LocalMessenger::new(MessagingConfig {
            transport: Transport::Tcp,
            bind_address: Some("10.0.0.1:40200".to_string()),
        });
        assert_eq!(
            messenger.peer_site(&PeerId::new("p1")),
            PeerSite::new("tcp://10.0.0.1:40200/p1")
        );
    }
}
