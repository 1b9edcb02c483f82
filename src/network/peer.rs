//! Peer link seam and the in-memory loopback mesh
//!
//! The match coordinator drives peer connections through [`PeerConnector`]
//! and [`PeerLink`] without knowing the transport. A link is negotiated the
//! WebRTC way: one side produces an offer description, the other answers,
//! both trickle transport candidates, and the link reports `Connected` once
//! the exchange suffices. Real deployments back this with a WebRTC stack;
//! [`LoopbackNet`] backs it with process-local queues for tests and the
//! demo.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::error::PeerError;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Channel the coordinator hands to every link it opens
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Events a peer link reports back to its owner
///
/// `session_id` names the remote end. `attempt` is the rebuild counter the
/// owner passed in; events from torn-down attempts are stale and must be
/// ignored.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalDescription {
        session_id: String,
        attempt: u64,
        desc: SessionDescription,
    },
    LocalCandidate {
        session_id: String,
        attempt: u64,
        candidate: IceCandidate,
    },
    Connected {
        session_id: String,
        attempt: u64,
    },
    Disconnected {
        session_id: String,
        attempt: u64,
    },
    Message {
        session_id: String,
        payload: Vec<u8>,
    },
}

/// One negotiated connection to a remote peer
pub trait PeerLink: Send + Sync {
    /// Remote session id
    fn session_id(&self) -> &str;

    fn attempt(&self) -> u64;

    /// Start negotiation from this side by producing an offer
    fn begin_offer(&self) -> Result<(), PeerError>;

    /// Apply the remote description. Applying an offer produces an answer.
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Send on the ordered reliable channel
    fn send(&self, payload: Vec<u8>) -> Result<(), PeerError>;

    fn close(&self);
}

/// Opens peer links for a coordinator
pub trait PeerConnector: Send + Sync + 'static {
    type Link: PeerLink;

    /// Create the local end of a link between `local` and `remote`.
    ///
    /// The link reports everything it does through `events`, tagged with
    /// `remote` and `attempt`.
    fn connect(
        &self,
        local: &str,
        remote: &str,
        attempt: u64,
        events: PeerEventSender,
    ) -> Self::Link;
}

struct LinkSlot {
    attempt: u64,
    events: PeerEventSender,
    offered: bool,
    local_described: bool,
    remote_described: bool,
    remote_candidates: usize,
    connected: bool,
    /// Payloads that arrived before this side finished connecting
    pending: Vec<Vec<u8>>,
}

impl LinkSlot {
    fn new(attempt: u64, events: PeerEventSender) -> Self {
        Self {
            attempt,
            events,
            offered: false,
            local_described: false,
            remote_described: false,
            remote_candidates: 0,
            connected: false,
            pending: Vec::new(),
        }
    }

    fn ready(&self) -> bool {
        self.local_described && self.remote_described && self.remote_candidates > 0
    }
}

#[derive(Default)]
struct HubState {
    // Keyed by (local, remote); the pair link is the reversed key
    links: HashMap<(String, String), LinkSlot>,
}

/// In-memory mesh implementing [`PeerConnector`]
///
/// Links negotiate with synthetic descriptions and candidates (one host
/// typed, one relay typed) and deliver payloads in order. [`LoopbackNet::sever`]
/// injects a transport failure on a live link.
#[derive(Clone, Default)]
pub struct LoopbackNet {
    hub: Arc<Mutex<HubState>>,
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the link between two sessions, both directions
    pub fn sever(&self, a: &str, b: &str) {
        let mut hub = self.hub.lock();
        for (local, remote) in [(a, b), (b, a)] {
            let key = (local.to_string(), remote.to_string());
            if let Some(slot) = hub.links.get_mut(&key) {
                if slot.connected {
                    slot.connected = false;
                    let _ = slot.events.send(PeerEvent::Disconnected {
                        session_id: remote.to_string(),
                        attempt: slot.attempt,
                    });
                }
            }
        }
        debug!("Severed loopback link {} <> {}", a, b);
    }
}

impl PeerConnector for LoopbackNet {
    type Link = LoopbackLink;

    fn connect(
        &self,
        local: &str,
        remote: &str,
        attempt: u64,
        events: PeerEventSender,
    ) -> LoopbackLink {
        let key = (local.to_string(), remote.to_string());
        self.hub
            .lock()
            .links
            .insert(key, LinkSlot::new(attempt, events));
        trace!("Loopback link {} -> {} attempt {}", local, remote, attempt);

        LoopbackLink {
            hub: self.hub.clone(),
            local: local.to_string(),
            remote: remote.to_string(),
            attempt,
        }
    }
}

/// One end of a loopback link
pub struct LoopbackLink {
    hub: Arc<Mutex<HubState>>,
    local: String,
    remote: String,
    attempt: u64,
}

impl LoopbackLink {
    fn key(&self) -> (String, String) {
        (self.local.clone(), self.remote.clone())
    }

    fn pair_key(&self) -> (String, String) {
        (self.remote.clone(), self.local.clone())
    }

    fn fake_sdp(&self, kind: SdpKind) -> SessionDescription {
        let label = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        SessionDescription {
            kind,
            sdp: format!(
                "v=0 loopback {} from {} to {} attempt {}",
                label, self.local, self.remote, self.attempt
            ),
        }
    }

    fn local_candidates(&self) -> [IceCandidate; 2] {
        [
            IceCandidate {
                media: "0".to_string(),
                index: 0,
                candidate: "candidate:1 1 UDP 2122252543 198.51.100.1 40000 typ host".to_string(),
            },
            IceCandidate {
                media: "0".to_string(),
                index: 0,
                candidate: "candidate:2 1 UDP 41885439 203.0.113.1 3478 typ relay raddr 198.51.100.1"
                    .to_string(),
            },
        ]
    }

    /// Emit the local description and candidates for this side
    fn describe_locally(&self, slot: &mut LinkSlot, kind: SdpKind) {
        slot.local_described = true;
        let _ = slot.events.send(PeerEvent::LocalDescription {
            session_id: self.remote.clone(),
            attempt: self.attempt,
            desc: self.fake_sdp(kind),
        });
        for candidate in self.local_candidates() {
            let _ = slot.events.send(PeerEvent::LocalCandidate {
                session_id: self.remote.clone(),
                attempt: self.attempt,
                candidate,
            });
        }
    }

    /// Flip to connected and flush anything that arrived early
    fn connect_if_ready(&self, slot: &mut LinkSlot) {
        if slot.connected || !slot.ready() {
            return;
        }
        slot.connected = true;
        let _ = slot.events.send(PeerEvent::Connected {
            session_id: self.remote.clone(),
            attempt: slot.attempt,
        });
        for payload in slot.pending.drain(..) {
            let _ = slot.events.send(PeerEvent::Message {
                session_id: self.remote.clone(),
                payload,
            });
        }
    }

    fn with_slot<T>(
        &self,
        f: impl FnOnce(&Self, &mut LinkSlot) -> Result<T, PeerError>,
    ) -> Result<T, PeerError> {
        let mut hub = self.hub.lock();
        let slot = hub
            .links
            .get_mut(&self.key())
            .filter(|slot| slot.attempt == self.attempt)
            .ok_or(PeerError::LinkClosed)?;
        f(self, slot)
    }
}

impl PeerLink for LoopbackLink {
    fn session_id(&self) -> &str {
        &self.remote
    }

    fn attempt(&self) -> u64 {
        self.attempt
    }

    fn begin_offer(&self) -> Result<(), PeerError> {
        self.with_slot(|link, slot| {
            if slot.offered || slot.local_described {
                return Err(PeerError::Negotiation("offer already made".to_string()));
            }
            slot.offered = true;
            link.describe_locally(slot, SdpKind::Offer);
            Ok(())
        })
    }

    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.with_slot(|link, slot| {
            if slot.remote_described {
                return Err(PeerError::Negotiation(
                    "remote description already set".to_string(),
                ));
            }
            slot.remote_described = true;

            // Answer an incoming offer from this side
            if desc.kind == SdpKind::Offer && !slot.local_described {
                link.describe_locally(slot, SdpKind::Answer);
            }
            link.connect_if_ready(slot);
            Ok(())
        })
    }

    fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), PeerError> {
        self.with_slot(|link, slot| {
            slot.remote_candidates += 1;
            link.connect_if_ready(slot);
            Ok(())
        })
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), PeerError> {
        let mut hub = self.hub.lock();

        let connected = hub
            .links
            .get(&self.key())
            .filter(|slot| slot.attempt == self.attempt)
            .map(|slot| slot.connected)
            .ok_or(PeerError::LinkClosed)?;
        if !connected {
            return Err(PeerError::LinkClosed);
        }

        let pair = hub
            .links
            .get_mut(&self.pair_key())
            .ok_or_else(|| PeerError::UnknownPeer(self.remote.clone()))?;
        if pair.connected {
            let _ = pair.events.send(PeerEvent::Message {
                session_id: self.local.clone(),
                payload,
            });
        } else {
            pair.pending.push(payload);
        }
        Ok(())
    }

    fn close(&self) {
        let mut hub = self.hub.lock();
        let removed = hub
            .links
            .remove(&self.key())
            .filter(|slot| slot.attempt == self.attempt);
        if removed.is_none() {
            // A newer attempt already replaced this link
            if let Some(slot) = hub.links.get(&self.key()) {
                trace!(
                    "Skipping close of {} -> {}: attempt {} superseded by {}",
                    self.local,
                    self.remote,
                    self.attempt,
                    slot.attempt
                );
            }
            return;
        }

        if let Some(pair) = hub.links.get_mut(&self.pair_key()) {
            if pair.connected {
                pair.connected = false;
                let _ = pair.events.send(PeerEvent::Disconnected {
                    session_id: self.local.clone(),
                    attempt: pair.attempt,
                });
            }
        }
        debug!("Closed loopback link {} -> {}", self.local, self.remote);
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        // Avoid double-teardown: close() already removed the slot
        let still_there = self
            .hub
            .lock()
            .links
            .get(&self.key())
            .is_some_and(|slot| slot.attempt == self.attempt);
        if still_there {
            warn!(
                "Loopback link {} -> {} dropped without close",
                self.local, self.remote
            );
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Feed one side's emitted negotiation back into the other side
    fn apply(events: &[PeerEvent], target: &LoopbackLink) {
        for event in events {
            match event {
                PeerEvent::LocalDescription { desc, .. } => {
                    target.set_remote_description(desc).unwrap();
                }
                PeerEvent::LocalCandidate { candidate, .. } => {
                    target.add_ice_candidate(candidate).unwrap();
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_offer_answer_connects_both_sides() {
        let net = LoopbackNet::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = net.connect("alice", "bob", 0, tx_a);
        let b = net.connect("bob", "alice", 0, tx_b);

        a.begin_offer().unwrap();
        let from_a = drain(&mut rx_a);
        assert!(matches!(
            from_a[0],
            PeerEvent::LocalDescription {
                desc: SessionDescription { kind: SdpKind::Offer, .. },
                ..
            }
        ));

        apply(&from_a, &b);
        let from_b = drain(&mut rx_b);
        assert!(from_b
            .iter()
            .any(|e| matches!(e, PeerEvent::Connected { .. })));

        apply(&from_b, &a);
        let from_a = drain(&mut rx_a);
        assert!(from_a
            .iter()
            .any(|e| matches!(e, PeerEvent::Connected { .. })));
    }

    #[test]
    fn test_send_delivers_in_order() {
        let net = LoopbackNet::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = net.connect("alice", "bob", 0, tx_a);
        let b = net.connect("bob", "alice", 0, tx_b);

        a.begin_offer().unwrap();
        apply(&drain(&mut rx_a), &b);
        apply(&drain(&mut rx_b), &a);
        drain(&mut rx_a);

        a.send(vec![1]).unwrap();
        a.send(vec![2]).unwrap();
        b.send(vec![9]).unwrap();

        let at_b: Vec<Vec<u8>> = drain(&mut rx_b)
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::Message { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(at_b, vec![vec![1], vec![2]]);

        let at_a: Vec<Vec<u8>> = drain(&mut rx_a)
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::Message { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(at_a, vec![vec![9]]);
    }

    #[test]
    fn test_early_send_buffers_until_connected() {
        let net = LoopbackNet::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = net.connect("alice", "bob", 0, tx_a);
        let b = net.connect("bob", "alice", 0, tx_b);

        // Bob gets the full offer and connects; alice has seen nothing back
        a.begin_offer().unwrap();
        let from_a = drain(&mut rx_a);
        apply(&from_a, &b);
        let from_b = drain(&mut rx_b);
        assert!(from_b
            .iter()
            .any(|e| matches!(e, PeerEvent::Connected { .. })));

        b.send(vec![7]).unwrap();
        assert!(drain(&mut rx_a).is_empty());

        // Alice catches up and the buffered payload lands after Connected
        apply(&from_b, &a);
        let at_a = drain(&mut rx_a);
        let connected_at = at_a
            .iter()
            .position(|e| matches!(e, PeerEvent::Connected { .. }))
            .expect("alice never connected");
        let message_at = at_a
            .iter()
            .position(|e| matches!(e, PeerEvent::Message { .. }))
            .expect("buffered payload never delivered");
        assert!(connected_at < message_at);
    }

    #[test]
    fn test_sever_disconnects_and_blocks_send() {
        let net = LoopbackNet::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = net.connect("alice", "bob", 0, tx_a);
        let b = net.connect("bob", "alice", 0, tx_b);

        a.begin_offer().unwrap();
        apply(&drain(&mut rx_a), &b);
        apply(&drain(&mut rx_b), &a);
        drain(&mut rx_a);
        drain(&mut rx_b);

        net.sever("alice", "bob");

        assert!(drain(&mut rx_a)
            .iter()
            .any(|e| matches!(e, PeerEvent::Disconnected { .. })));
        assert!(drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, PeerEvent::Disconnected { .. })));
        assert!(a.send(vec![1]).is_err());
    }

    #[test]
    fn test_double_offer_rejected() {
        let net = LoopbackNet::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let a = net.connect("alice", "bob", 0, tx_a);

        a.begin_offer().unwrap();
        assert!(a.begin_offer().is_err());
    }

    #[test]
    fn test_stale_attempt_is_inert() {
        let net = LoopbackNet::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_a2, mut rx_a2) = mpsc::unbounded_channel();
        let old = net.connect("alice", "bob", 0, tx_a);
        let new = net.connect("alice", "bob", 1, tx_a2);

        // The replaced link can no longer act on the slot
        assert!(old.begin_offer().is_err());
        old.close();

        // And closing it did not remove the new attempt
        new.begin_offer().unwrap();
        assert!(!drain(&mut rx_a2).is_empty());
    }
}
