//! The parent dispatcher: routes inbound node-relay packets to per-payment
//! relay instances and tears instances down when they complete.
//!
//! Exactly one live instance exists per `(payment_hash, payment_secret)`.
//! On completion the mapping is removed first and `Stop` is sent second, so
//! an instance must tolerate stray messages in between; a packet for a
//! removed key simply creates a fresh instance.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::primitives::{PaymentHash, PaymentSecret, RelayId};
use crate::provider::AggregatorFactory;
use crate::relay::actor::{
    IncomingPacket, RelayActor, RelayCompleted, RelayMessage, RelayProviders,
};
use crate::relay::machine::Relay;

/// Key under which the parent finds a relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
}

/// Mailbox depth per relay instance. Inbound parts, collaborator answers
/// and the final Stop all fit comfortably; senders await when the actor
/// falls behind.
const MAILBOX_CAPACITY: usize = 64;
const COMPLETION_CAPACITY: usize = 256;

struct RelayHandle {
    mailbox: mpsc::Sender<RelayMessage>,
    task: JoinHandle<()>,
}

/// Routes packets to relay instances, one per key.
pub struct RelayDispatcher {
    relays: Mutex<HashMap<RelayKey, RelayHandle>>,
    config: RelayConfig,
    providers: RelayProviders,
    aggregators: Arc<dyn AggregatorFactory>,
    completions: mpsc::Sender<RelayCompleted>,
}

impl RelayDispatcher {
    /// Creates the dispatcher and starts its completion loop. The loop ends
    /// when the dispatcher is dropped.
    pub fn new(
        config: RelayConfig,
        providers: RelayProviders,
        aggregators: Arc<dyn AggregatorFactory>,
    ) -> Arc<Self> {
        let (completions, completion_rx) = mpsc::channel(COMPLETION_CAPACITY);
        let dispatcher = Arc::new(Self {
            relays: Mutex::new(HashMap::new()),
            config,
            providers,
            aggregators,
            completions,
        });
        Self::spawn_completion_loop(Arc::downgrade(&dispatcher), completion_rx);
        dispatcher
    }

    fn spawn_completion_loop(
        dispatcher: Weak<Self>,
        mut completion_rx: mpsc::Receiver<RelayCompleted>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(completed) = completion_rx.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.finish_relay(completed).await;
            }
        })
    }

    /// Routes one decrypted node-relay packet, creating the relay instance
    /// on the first part of a payment.
    pub async fn relay(&self, packet: IncomingPacket) {
        let key = RelayKey {
            payment_hash: packet.payment_hash,
            payment_secret: packet.payment_secret,
        };

        let mailbox = {
            let mut relays = self.relays.lock().await;
            match relays.get(&key) {
                Some(handle) => handle.mailbox.clone(),
                None => {
                    let handle = self.start_relay(&packet);
                    let mailbox = handle.mailbox.clone();
                    relays.insert(key, handle);
                    mailbox
                }
            }
        }; // Lock released before the (possibly awaiting) send.

        if mailbox.send(RelayMessage::Relay(Box::new(packet))).await.is_err() {
            // The instance stopped between lookup and send; the part is left
            // to the sender's retry, like any in-flight HTLC on restart.
            warn!("relay instance for {} is gone, dropping part", key.payment_hash);
        }
    }

    fn start_relay(&self, packet: &IncomingPacket) -> RelayHandle {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let relay = Relay::new(
            RelayId::random(),
            packet.payment_hash,
            packet.payment_secret,
            packet.instructions.clone(),
            packet.next_packet.clone(),
            self.config.clone(),
        );
        debug!("{} created for payment {}", relay.id(), packet.payment_hash);

        let aggregator = self.aggregators.create(
            packet.payment_hash,
            packet.total_amount,
            mailbox_tx.clone(),
        );
        let actor = RelayActor::new(
            relay,
            mailbox_rx,
            mailbox_tx.clone(),
            aggregator,
            self.providers.clone(),
            self.completions.clone(),
        );

        RelayHandle {
            mailbox: mailbox_tx,
            task: actor.spawn(),
        }
    }

    /// Removes the completed instance, then tells it to stop.
    async fn finish_relay(&self, completed: RelayCompleted) {
        let key = RelayKey {
            payment_hash: completed.payment_hash,
            payment_secret: completed.payment_secret,
        };
        let handle = {
            let mut relays = self.relays.lock().await;
            relays.remove(&key)
        };
        match handle {
            Some(handle) => {
                let _ = handle.mailbox.send(RelayMessage::Stop).await;
                debug!("relay for payment {} finished", completed.payment_hash);
            }
            None => {
                // Duplicate completion (e.g. an abort racing a failure).
                debug!(
                    "completion for unknown relay, payment {}",
                    completed.payment_hash
                );
            }
        }
    }

    /// The number of live relay instances.
    pub async fn active_relay_count(&self) -> usize {
        self.relays.lock().await.len()
    }

    /// The keys of all live relay instances.
    pub async fn relay_keys(&self) -> Vec<RelayKey> {
        self.relays.lock().await.keys().copied().collect()
    }

    /// Awaits termination of every live relay task. Test helper; production
    /// shutdown relies on the channel layer reclaiming in-flight HTLCs.
    pub async fn drain(&self) {
        let handles: Vec<RelayHandle> = {
            let mut relays = self.relays.lock().await;
            relays.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.mailbox.send(RelayMessage::Stop).await;
            let _ = handle.task.await;
        }
    }
}
