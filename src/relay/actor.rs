//! The relay actor: one task per relay instance, consuming typed messages
//! from a private mailbox and executing the state machine's outputs through
//! the provider seams.
//!
//! Collaborator messages are adapted into [`RelayInput`]s at this boundary;
//! the state machine never sees a collaborator type. Inputs that depend on
//! the chain tip get the height attached here.

use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use log::{debug, error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::failure::{DownstreamFailure, FailureMessage};
use crate::primitives::{BlockHeight, ChannelId, Msat, PaymentHash, PaymentPreimage, PaymentSecret};
use crate::provider::{
    AsyncPaymentTriggerer, BlindedPathResolver, BlockHeightProvider, OutboundPaymentFactory,
    PartAggregator, RelayEventEmitter, RelayTelemetry, RELAY_TYPE_TRAMPOLINE,
};
use crate::relay::instructions::{BlindedPath, NextOnionPacket, RelayInstructions};
use crate::relay::machine::{IncomingHtlc, Relay, RelayEvent, RelayInput, RelayOutput};
use crate::relay::settlement::UpstreamSettler;

// ============================================================================
// Mailbox messages
// ============================================================================

/// A decrypted node-relay packet from the onion layer: outer payload fields,
/// the raw HTLC, the inner instructions and optionally the next onion.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
    pub total_amount: Msat,
    pub htlc: IncomingHtlc,
    pub instructions: RelayInstructions,
    pub next_packet: Option<NextOnionPacket>,
}

/// Events from the inbound multi-part aggregator.
#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    /// The set is complete.
    Succeeded,
    /// The set cannot complete (timeout, over-payment, policy). `reason` is
    /// the failure to return upstream; the default incorrect-details
    /// failure is used when absent.
    Failed { reason: Option<FailureMessage> },
    /// A part arrived after the set was closed.
    ExtraPart {
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
    },
}

/// Events from the outbound payment executor. `PreimageReceived` is always
/// delivered before the corresponding `Sent`.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    PreimageReceived {
        preimage: PaymentPreimage,
    },
    Sent {
        preimage: PaymentPreimage,
        parts: Vec<Msat>,
        recipient_node_id: PublicKey,
        recipient_amount: Msat,
    },
    Failed {
        failures: Vec<DownstreamFailure>,
    },
}

/// Events from the async-payment triggerer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Triggered,
    Timeout,
    Canceled,
}

/// Everything a relay instance can receive through its mailbox.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Relay(Box<IncomingPacket>),
    Aggregator(AggregatorEvent),
    Outbound(OutboundEvent),
    Trigger(TriggerEvent),
    PathsResolved(Vec<BlindedPath>),
    /// From the parent, after it processed the completion notification.
    Stop,
}

/// Completion notification to the parent dispatcher, sent exactly once when
/// the relay enters its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCompleted {
    pub payment_hash: PaymentHash,
    pub payment_secret: PaymentSecret,
}

// ============================================================================
// Provider bundle
// ============================================================================

/// The shared collaborators handed to every relay instance.
#[derive(Clone)]
pub struct RelayProviders {
    pub block_height: Arc<dyn BlockHeightProvider>,
    pub outbound: Arc<dyn OutboundPaymentFactory>,
    pub triggerer: Arc<dyn AsyncPaymentTriggerer>,
    pub resolver: Arc<dyn BlindedPathResolver>,
    pub settler: UpstreamSettler,
    pub events: Arc<dyn RelayEventEmitter>,
    pub telemetry: Arc<dyn RelayTelemetry>,
}

// ============================================================================
// Actor
// ============================================================================

/// Runs one relay instance over its mailbox.
pub struct RelayActor {
    relay: Relay,
    mailbox: mpsc::Receiver<RelayMessage>,
    /// Handed to children so their answers land in the same mailbox.
    mailbox_tx: mpsc::Sender<RelayMessage>,
    aggregator: Arc<dyn PartAggregator>,
    providers: RelayProviders,
    completions: mpsc::Sender<RelayCompleted>,
}

impl RelayActor {
    pub fn new(
        relay: Relay,
        mailbox: mpsc::Receiver<RelayMessage>,
        mailbox_tx: mpsc::Sender<RelayMessage>,
        aggregator: Arc<dyn PartAggregator>,
        providers: RelayProviders,
        completions: mpsc::Sender<RelayCompleted>,
    ) -> Self {
        Self {
            relay,
            mailbox,
            mailbox_tx,
            aggregator,
            providers,
            completions,
        }
    }

    /// Starts the actor as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        debug!(
            "{} started for payment {}",
            self.relay.id(),
            self.relay.payment_hash()
        );
        self.providers
            .events
            .emit(RelayEvent::RelayCreated {
                relay_id: self.relay.id(),
                payment_hash: self.relay.payment_hash(),
            })
            .await;

        while let Some(message) = self.mailbox.recv().await {
            if matches!(message, RelayMessage::Stop) {
                break;
            }

            let Some(input) = self.adapt(message).await else {
                continue;
            };
            let result = self.relay.apply(input);
            self.providers.events.emit_all(result.events).await;

            let mut abort = false;
            for output in result.outputs {
                abort |= self.execute(output).await;
            }
            if abort {
                break;
            }
        }

        debug!(
            "{} stopped in phase {}",
            self.relay.id(),
            self.relay.phase()
        );
    }

    /// Wraps a collaborator message into a state-machine input.
    async fn adapt(&self, message: RelayMessage) -> Option<RelayInput> {
        let input = match message {
            RelayMessage::Relay(packet) => RelayInput::HtlcArrived {
                htlc: packet.htlc,
                payment_secret: packet.payment_secret,
                height: self.height().await,
            },
            RelayMessage::Aggregator(AggregatorEvent::Succeeded) => {
                RelayInput::AggregationSucceeded {
                    height: self.height().await,
                }
            }
            RelayMessage::Aggregator(AggregatorEvent::Failed { reason }) => {
                RelayInput::AggregationFailed {
                    reason,
                    height: self.height().await,
                }
            }
            RelayMessage::Aggregator(AggregatorEvent::ExtraPart {
                channel_id,
                htlc_id,
                amount,
            }) => RelayInput::AggregatorExtraPart {
                channel_id,
                htlc_id,
                amount,
                height: self.height().await,
            },
            RelayMessage::Outbound(OutboundEvent::PreimageReceived { preimage }) => {
                RelayInput::PreimageReceived { preimage }
            }
            RelayMessage::Outbound(OutboundEvent::Sent {
                preimage,
                parts,
                recipient_node_id,
                recipient_amount,
            }) => RelayInput::DownstreamSent {
                preimage,
                parts,
                recipient_node_id,
                recipient_amount,
            },
            RelayMessage::Outbound(OutboundEvent::Failed { failures }) => {
                RelayInput::DownstreamFailed { failures }
            }
            RelayMessage::Trigger(TriggerEvent::Triggered) => RelayInput::AsyncTriggered,
            RelayMessage::Trigger(TriggerEvent::Timeout) => RelayInput::AsyncHoldExpired,
            RelayMessage::Trigger(TriggerEvent::Canceled) => RelayInput::AsyncCanceled,
            RelayMessage::PathsResolved(paths) => RelayInput::BlindedPathsResolved { paths },
            RelayMessage::Stop => return None,
        };
        Some(input)
    }

    /// Fetches the chain tip; a fetch error is operational, logged and
    /// substituted with height 0 so the message is not lost.
    async fn height(&self) -> BlockHeight {
        match self.providers.block_height.current_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!("block height fetch failed: {}", e);
                0
            }
        }
    }

    /// Executes one output. Returns true when the actor must terminate.
    async fn execute(&self, output: RelayOutput) -> bool {
        match output {
            RelayOutput::ForwardToAggregator { htlc } => {
                if let Err(e) = self.aggregator.part_received(htlc).await {
                    warn!("{} aggregator rejected part: {}", self.relay.id(), e);
                }
            }
            RelayOutput::FulfillUpstream { parts, preimage } => {
                if let Err(e) = self.providers.settler.fulfill_set(&parts, preimage).await {
                    // Persistence failed: the preimage is known but the
                    // fulfill may not survive a restart.
                    error!("{} failed to persist fulfill: {}", self.relay.id(), e);
                }
            }
            RelayOutput::FailUpstream { parts, reason } => {
                if let Err(e) = self.providers.settler.fail_set(&parts, reason).await {
                    error!("{} failed to persist fail: {}", self.relay.id(), e);
                }
            }
            RelayOutput::FailStray {
                channel_id,
                htlc_id,
                reason,
            } => {
                if let Err(e) = self
                    .providers
                    .settler
                    .fail_one(channel_id, htlc_id, reason)
                    .await
                {
                    error!("{} failed to persist stray fail: {}", self.relay.id(), e);
                }
            }
            RelayOutput::SpawnOutbound { dispatch } => {
                if let Err(e) = self
                    .providers
                    .outbound
                    .spawn_payment(dispatch, self.mailbox_tx.clone())
                    .await
                {
                    warn!("{} outbound spawn failed: {}", self.relay.id(), e);
                    // Feed the failure back so the upstream set is failed
                    // instead of dangling until its own expiry.
                    let _ = self
                        .mailbox_tx
                        .try_send(RelayMessage::Outbound(OutboundEvent::Failed {
                            failures: vec![],
                        }));
                }
            }
            RelayOutput::WatchAsyncTrigger {
                outgoing_node_id,
                deadline_block,
            } => {
                if let Err(e) = self
                    .providers
                    .triggerer
                    .watch(
                        outgoing_node_id,
                        self.relay.payment_hash(),
                        deadline_block,
                        self.mailbox_tx.clone(),
                    )
                    .await
                {
                    warn!("{} trigger watch failed: {}", self.relay.id(), e);
                    let _ = self
                        .mailbox_tx
                        .try_send(RelayMessage::Trigger(TriggerEvent::Canceled));
                }
            }
            RelayOutput::ResolveBlindedPaths { paths } => {
                if let Err(e) = self
                    .providers
                    .resolver
                    .resolve(paths, self.mailbox_tx.clone())
                    .await
                {
                    warn!("{} blinded-path resolution failed: {}", self.relay.id(), e);
                    let _ = self.mailbox_tx.try_send(RelayMessage::PathsResolved(vec![]));
                }
            }
            RelayOutput::RelayComplete => {
                let completed = RelayCompleted {
                    payment_hash: self.relay.payment_hash(),
                    payment_secret: self.relay.payment_secret(),
                };
                if self.completions.send(completed).await.is_err() {
                    warn!("{} parent is gone, stopping", self.relay.id());
                    return true;
                }
            }
            RelayOutput::RecordDuration { success, elapsed } => {
                self.providers.telemetry.record_relay_duration(
                    RELAY_TYPE_TRAMPOLINE,
                    success,
                    elapsed,
                );
            }
            RelayOutput::CountFailure { class } => {
                self.providers.telemetry.relay_failed(class);
            }
            RelayOutput::InvariantViolation { message } => {
                error!("{} aborting: {}", self.relay.id(), message);
                let completed = RelayCompleted {
                    payment_hash: self.relay.payment_hash(),
                    payment_secret: self.relay.payment_secret(),
                };
                let _ = self.completions.send(completed).await;
                return true;
            }
        }
        false
    }
}
