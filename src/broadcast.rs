//! Best-effort, in-process pub/sub shared by all clients of one local store.
//!
//! Messages are dropped on backpressure (a slow receiver lags and loses the
//! oldest entries), so receivers must stay correct under arbitrary loss: the
//! store remains the source of truth, and commit notifications carry refs
//! only; recipients pull full commit data from the store.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::leader::ElectionMessage;
use crate::presence::PresenceRecord;
use crate::status::RemoteState;

/// Buffered messages per channel before lagging receivers start dropping.
const CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// New commits landed in the shared store; refs only.
    Commits { origin: String, refs: Vec<String> },
    /// A client joined and wants the current roster announced back.
    Join(PresenceRecord),
    /// A client updated its presence.
    Presence(PresenceRecord),
    /// A client left.
    Leave { user_id: String, client_id: String },
    Election(ElectionMessage),
    /// The current leader's view of the remote, proxied to followers.
    RemoteState { origin: String, state: RemoteState },
}

// ============================================================================
// Hub
// ============================================================================

/// Registry of per-document channels. One hub per store factory; clients
/// sharing a doc id share a channel.
#[derive(Debug, Default)]
pub struct MessageHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl MessageHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the channel for `doc_id`, creating it on first use.
    pub fn join(
        &self,
        doc_id: &str,
    ) -> (
        broadcast::Sender<ChannelMessage>,
        broadcast::Receiver<ChannelMessage>,
    ) {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(doc_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let rx = tx.subscribe();
        (tx, rx)
    }

    /// Tear down the channel for a deleted document.
    pub fn remove(&self, doc_id: &str) {
        self.channels.lock().remove(doc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_on_one_doc_see_each_other() {
        let hub = MessageHub::new();
        let (tx_a, _rx_a) = hub.join("doc");
        let (_tx_b, mut rx_b) = hub.join("doc");

        tx_a.send(ChannelMessage::Commits {
            origin: "a".to_string(),
            refs: vec!["r1".to_string()],
        })
        .unwrap();

        match rx_b.recv().await.unwrap() {
            ChannelMessage::Commits { origin, refs } => {
                assert_eq!(origin, "a");
                assert_eq!(refs, vec!["r1".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn docs_are_isolated() {
        let hub = MessageHub::new();
        let (tx_a, _rx_a) = hub.join("doc-1");
        let (_tx_b, mut rx_b) = hub.join("doc-2");

        tx_a.send(ChannelMessage::Leave {
            user_id: "u".to_string(),
            client_id: "a".to_string(),
        })
        .unwrap();

        assert!(matches!(
            rx_b.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn slow_receiver_lags_instead_of_blocking_sender() {
        let hub = MessageHub::new();
        let (tx, mut rx) = hub.join("doc");

        for i in 0..(CHANNEL_CAPACITY + 10) {
            tx.send(ChannelMessage::Commits {
                origin: "a".to_string(),
                refs: vec![format!("r{i}")],
            })
            .unwrap();
        }

        // The oldest messages are gone; reception resumes afterwards.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(rx.recv().await.is_ok());
    }
}
