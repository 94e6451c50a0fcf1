//! Provider traits: the seams between the relay core and the rest of the
//! node.
//!
//! The register, router, event bus, metrics, pending-commands store,
//! async-payment triggerer and blinded-path resolver are shared, thread-safe
//! collaborators owned elsewhere; the relay reaches them only through these
//! traits. Collaborators that report back asynchronously (aggregator,
//! outbound executor, triggerer, resolver) are handed the relay's mailbox
//! sender and answer with [`RelayMessage`]s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use tokio::sync::mpsc;

use crate::primitives::{BlockHeight, Msat, PaymentHash};
use crate::relay::actor::RelayMessage;
use crate::relay::dispatch::OutboundDispatch;
use crate::relay::instructions::CompactBlindedPath;
use crate::relay::machine::{IncomingHtlc, RelayEvent};
use crate::relay::settlement::{PendingCommand, SettlementCommand};

// ============================================================================
// Chain and channel providers
// ============================================================================

#[async_trait]
pub trait BlockHeightProvider: Send + Sync {
    async fn current_height(&self) -> Result<BlockHeight>;
}

/// The channel register: routes settlement commands to the owning channel.
#[async_trait]
pub trait ChannelRegister: Send + Sync {
    async fn send_command(&self, command: &SettlementCommand) -> Result<()>;
}

/// Durable store for settlement commands awaiting register acknowledgement.
/// Implementations deduplicate by `(channel_id, htlc_id)` and replay
/// unacknowledged commands after a restart.
#[async_trait]
pub trait PendingCommandStore: Send + Sync {
    async fn persist(&self, command: &PendingCommand) -> Result<()>;
}

// ============================================================================
// Inbound aggregation
// ============================================================================

/// The per-payment multi-part aggregator. The relay forwards every accepted
/// part; the aggregator owns the completion timeout and policy and answers
/// through the mailbox with [`AggregatorEvent`](crate::relay::actor::AggregatorEvent).
#[async_trait]
pub trait PartAggregator: Send + Sync {
    async fn part_received(&self, htlc: IncomingHtlc) -> Result<()>;
}

/// Creates one aggregator per relay instance.
pub trait AggregatorFactory: Send + Sync {
    fn create(
        &self,
        payment_hash: PaymentHash,
        total_amount: Msat,
        mailbox: mpsc::Sender<RelayMessage>,
    ) -> Arc<dyn PartAggregator>;
}

// ============================================================================
// Outbound payment
// ============================================================================

/// Spawns the downstream payment executor, choosing the single-part or
/// multi-part implementation from the dispatch. The executor reports back
/// through the mailbox with [`OutboundEvent`](crate::relay::actor::OutboundEvent),
/// delivering the preimage before the final send confirmation.
#[async_trait]
pub trait OutboundPaymentFactory: Send + Sync {
    async fn spawn_payment(
        &self,
        dispatch: OutboundDispatch,
        mailbox: mpsc::Sender<RelayMessage>,
    ) -> Result<()>;
}

// ============================================================================
// Async payments and blinded paths
// ============================================================================

/// Watches for the peer-ready signal of a held async payment. Exactly one of
/// `Triggered`, `Timeout` or `Canceled` is delivered to the mailbox.
#[async_trait]
pub trait AsyncPaymentTriggerer: Send + Sync {
    async fn watch(
        &self,
        outgoing_node_id: PublicKey,
        payment_hash: PaymentHash,
        deadline_block: BlockHeight,
        mailbox: mpsc::Sender<RelayMessage>,
    ) -> Result<()>;
}

/// Resolves compact blinded-path introductions against the channel graph,
/// answering with the (possibly empty) resolved paths.
#[async_trait]
pub trait BlindedPathResolver: Send + Sync {
    async fn resolve(
        &self,
        paths: Vec<CompactBlindedPath>,
        mailbox: mpsc::Sender<RelayMessage>,
    ) -> Result<()>;
}

// ============================================================================
// Events and telemetry
// ============================================================================

/// Sink for relay events (event bus, logging). Implementations should be
/// fast and non-blocking.
#[async_trait]
pub trait RelayEventEmitter: Send + Sync {
    async fn emit(&self, event: RelayEvent);

    async fn emit_all(&self, events: Vec<RelayEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }
}

/// Relay-type tag attached to the duration histogram. This core only
/// performs trampoline relays; channel-level relaying records under its own
/// tag elsewhere in the node.
pub const RELAY_TYPE_TRAMPOLINE: &str = "trampoline";

/// Metrics sink for the relay core.
pub trait RelayTelemetry: Send + Sync {
    /// Bumps the relay-failure counter, tagged by failure class name.
    fn relay_failed(&self, class: &'static str);

    /// Records one relay duration, from entering Sending to Stopping,
    /// tagged by relay type and success/failure.
    fn record_relay_duration(&self, relay_type: &'static str, success: bool, elapsed: Duration);
}

/// No-op event emitter that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoOpEventEmitter;

#[async_trait]
impl RelayEventEmitter for NoOpEventEmitter {
    async fn emit(&self, _event: RelayEvent) {}
}

/// No-op telemetry sink.
#[derive(Debug, Clone, Default)]
pub struct NoOpTelemetry;

impl RelayTelemetry for NoOpTelemetry {
    fn relay_failed(&self, _class: &'static str) {}

    fn record_relay_duration(&self, _relay_type: &'static str, _success: bool, _elapsed: Duration) {
    }
}
