//! The per-payment relay state machine.
//!
//! The machine is pure: [`Relay::apply`] consumes a typed input and returns
//! the events to emit and the outputs to execute, without performing any
//! I/O itself. The actor loop in [`crate::relay::actor`] owns the side
//! effects. This keeps every transition testable in isolation.

use std::time::{Duration, Instant};

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};

use crate::config::RelayConfig;
use crate::failure::{
    translate_downstream_failures, DownstreamFailure, FailureMessage, ASYNC_HOLD_FAILURE,
};
use crate::primitives::{BlockHeight, ChannelId, Msat, PaymentHash, PaymentPreimage, PaymentSecret, RelayId};
use crate::relay::dispatch::{self, OutboundDispatch};
use crate::relay::instructions::{
    BlindedForward, BlindedPath, CompactBlindedPath, NextOnionPacket, RelayInstructions,
    TrampolineForward,
};
use crate::relay::validation::validate_relay;

// ============================================================================
// Upstream HTLC set
// ============================================================================

/// One inbound HTLC belonging to the multi-part set addressed to this node.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingHtlc {
    pub htlc_id: u64,
    pub channel_id: ChannelId,
    pub amount: Msat,
    pub cltv_expiry: BlockHeight,
    pub received_at: DateTime<Utc>,
}

/// The completed inbound set, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSet {
    parts: Vec<IncomingHtlc>,
}

impl UpstreamSet {
    pub fn new(parts: Vec<IncomingHtlc>) -> Self {
        UpstreamSet { parts }
    }

    pub fn parts(&self) -> &[IncomingHtlc] {
        &self.parts
    }

    /// Total inbound amount.
    pub fn amount_in(&self) -> Msat {
        self.parts.iter().map(|p| p.amount).sum()
    }

    /// The binding expiry of the set: the minimum over all parts.
    pub fn expiry_in(&self) -> BlockHeight {
        self.parts
            .iter()
            .map(|p| p.cltv_expiry)
            .min()
            .unwrap_or_default()
    }
}

// ============================================================================
// Phase, inputs, outputs, events
// ============================================================================

/// Which phase the relay is in (for logging and metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Receiving,
    WaitingForAsyncTrigger,
    ResolvingBlindedPaths,
    Sending,
    Stopping,
}

impl std::fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayPhase::Receiving => write!(f, "receiving"),
            RelayPhase::WaitingForAsyncTrigger => write!(f, "waiting_for_async_trigger"),
            RelayPhase::ResolvingBlindedPaths => write!(f, "resolving_blinded_paths"),
            RelayPhase::Sending => write!(f, "sending"),
            RelayPhase::Stopping => write!(f, "stopping"),
        }
    }
}

/// The relay state. Data moves between variants as the relay progresses.
#[derive(Debug, Clone)]
pub enum RelayState {
    /// Accumulating inbound HTLCs until the aggregator closes the set.
    Receiving {
        parts: Vec<IncomingHtlc>,
        instructions: RelayInstructions,
        next_packet: Option<NextOnionPacket>,
    },

    /// Validated async payment held until the recipient's peer signals ready.
    WaitingForAsyncTrigger {
        upstream: UpstreamSet,
        forward: TrampolineForward,
        next_packet: Option<NextOnionPacket>,
    },

    /// Waiting for compact blinded introduction nodes to be resolved.
    ResolvingBlindedPaths {
        upstream: UpstreamSet,
        forward: BlindedForward,
    },

    /// The downstream executor is running.
    Sending {
        upstream: UpstreamSet,
        /// The declared next trampoline node; `None` for blinded relays,
        /// which must never surface a downstream failure upstream.
        outgoing_node_id: Option<PublicKey>,
        amount_to_forward: Msat,
        started_at: Instant,
        fulfilled_upstream: bool,
    },

    /// Terminal; the parent has been notified, stragglers are drained.
    Stopping,
}

impl RelayState {
    pub fn phase(&self) -> RelayPhase {
        match self {
            RelayState::Receiving { .. } => RelayPhase::Receiving,
            RelayState::WaitingForAsyncTrigger { .. } => RelayPhase::WaitingForAsyncTrigger,
            RelayState::ResolvingBlindedPaths { .. } => RelayPhase::ResolvingBlindedPaths,
            RelayState::Sending { .. } => RelayPhase::Sending,
            RelayState::Stopping => RelayPhase::Stopping,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayState::Stopping)
    }
}

/// All inputs that can drive a state transition. Inputs that depend on the
/// chain tip carry the height, fetched by the actor at the boundary.
#[derive(Debug, Clone)]
pub enum RelayInput {
    /// An inbound HTLC addressed to this relay arrived.
    HtlcArrived {
        htlc: IncomingHtlc,
        payment_secret: PaymentSecret,
        height: BlockHeight,
    },

    /// The aggregator closed the set successfully.
    AggregationSucceeded { height: BlockHeight },

    /// The aggregator gave up (timeout, over-payment, policy). When it
    /// supplies no reason the default incorrect-details failure is used.
    AggregationFailed {
        reason: Option<FailureMessage>,
        height: BlockHeight,
    },

    /// The aggregator flagged a part as outside the set (arrival raced the
    /// set completion).
    AggregatorExtraPart {
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
        height: BlockHeight,
    },

    /// The async-payment trigger fired; release the held payment.
    AsyncTriggered,
    /// The async-payment hold reached its deadline.
    AsyncHoldExpired,
    /// The async-payment hold was canceled.
    AsyncCanceled,

    /// Blinded-path resolution finished, possibly with no usable path.
    BlindedPathsResolved { paths: Vec<BlindedPath> },

    /// The downstream executor learnt the preimage. Always delivered before
    /// the corresponding `DownstreamSent`.
    PreimageReceived { preimage: PaymentPreimage },

    /// The downstream payment fully succeeded.
    DownstreamSent {
        preimage: PaymentPreimage,
        parts: Vec<Msat>,
        recipient_node_id: PublicKey,
        recipient_amount: Msat,
    },

    /// The downstream payment failed after exhausting its attempts.
    DownstreamFailed { failures: Vec<DownstreamFailure> },
}

/// Commands produced by a transition, executed by the actor.
#[derive(Debug, Clone)]
pub enum RelayOutput {
    /// Hand the accepted part to the inbound aggregator.
    ForwardToAggregator { htlc: IncomingHtlc },

    /// Fulfill every HTLC of the set upstream with the preimage.
    FulfillUpstream {
        parts: Vec<IncomingHtlc>,
        preimage: PaymentPreimage,
    },

    /// Fail every HTLC of the set upstream with the same reason.
    FailUpstream {
        parts: Vec<IncomingHtlc>,
        reason: FailureMessage,
    },

    /// Fail a single stray HTLC, leaving the relay untouched.
    FailStray {
        channel_id: ChannelId,
        htlc_id: u64,
        reason: FailureMessage,
    },

    /// Spawn the outbound payment executor.
    SpawnOutbound { dispatch: OutboundDispatch },

    /// Ask the triggerer to watch for the peer-ready signal.
    WatchAsyncTrigger {
        outgoing_node_id: PublicKey,
        deadline_block: BlockHeight,
    },

    /// Ask the resolver to resolve compact blinded paths.
    ResolveBlindedPaths { paths: Vec<CompactBlindedPath> },

    /// Notify the parent that this relay reached its terminal state.
    RelayComplete,

    /// Record the Sending-to-Stopping duration.
    RecordDuration { success: bool, elapsed: Duration },

    /// Bump the relay-failure counter.
    CountFailure { class: &'static str },

    /// A programming invariant was violated; the instance must be torn down.
    InvariantViolation { message: String },
}

/// One part of a relayed payment, as reported in the relayed event.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedPart {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub amount: Msat,
}

/// Events emitted for the event bus and telemetry.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    RelayCreated {
        relay_id: RelayId,
        payment_hash: PaymentHash,
    },
    PartReceived {
        payment_hash: PaymentHash,
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
        cltv_expiry: BlockHeight,
        parts_count: usize,
        parts_sum: Msat,
    },
    WaitingToRelayPayment {
        outgoing_node_id: PublicKey,
        payment_hash: PaymentHash,
    },
    TrampolinePaymentRelayed {
        payment_hash: PaymentHash,
        incoming_parts: Vec<RelayedPart>,
        outgoing_parts: Vec<Msat>,
        recipient_node_id: PublicKey,
        recipient_amount: Msat,
    },
    RelayFailed {
        payment_hash: PaymentHash,
        reason: FailureMessage,
    },
    StrayPartRejected {
        payment_hash: PaymentHash,
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
    },
}

/// The result of applying an input: events to emit, outputs to execute.
#[derive(Debug, Clone, Default)]
pub struct ApplyResult {
    pub events: Vec<RelayEvent>,
    pub outputs: Vec<RelayOutput>,
}

// ============================================================================
// Relay
// ============================================================================

/// A single relay instance, created at the first inbound HTLC of a payment
/// and torn down after settlement.
#[derive(Debug)]
pub struct Relay {
    id: RelayId,
    payment_hash: PaymentHash,
    /// The payment secret of the first observed part; every later part must
    /// carry the same one.
    payment_secret: PaymentSecret,
    config: RelayConfig,
    state: RelayState,
}

impl Relay {
    /// Creates a relay in the Receiving state from the first inbound packet.
    pub fn new(
        id: RelayId,
        payment_hash: PaymentHash,
        payment_secret: PaymentSecret,
        instructions: RelayInstructions,
        next_packet: Option<NextOnionPacket>,
        config: RelayConfig,
    ) -> Self {
        Self {
            id,
            payment_hash,
            payment_secret,
            config,
            state: RelayState::Receiving {
                parts: Vec::new(),
                instructions,
                next_packet,
            },
        }
    }

    pub fn id(&self) -> RelayId {
        self.id
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    pub fn payment_secret(&self) -> PaymentSecret {
        self.payment_secret
    }

    pub fn phase(&self) -> RelayPhase {
        self.state.phase()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies one input, returning the events and outputs of the
    /// transition. Inputs that do not apply to the current state are
    /// ignored; the parent may legitimately deliver stragglers after the
    /// relay completed.
    pub fn apply(&mut self, input: RelayInput) -> ApplyResult {
        match input {
            RelayInput::HtlcArrived {
                htlc,
                payment_secret,
                height,
            } => self.on_htlc_arrived(htlc, payment_secret, height),
            RelayInput::AggregationSucceeded { height } => self.on_aggregation_succeeded(height),
            RelayInput::AggregationFailed { reason, height } => {
                self.on_aggregation_failed(reason, height)
            }
            RelayInput::AggregatorExtraPart {
                channel_id,
                htlc_id,
                amount,
                height,
            } => self.on_extra_part(channel_id, htlc_id, amount, height),
            RelayInput::AsyncTriggered => self.on_async_triggered(),
            RelayInput::AsyncHoldExpired | RelayInput::AsyncCanceled => self.on_async_hold_ended(),
            RelayInput::BlindedPathsResolved { paths } => self.on_paths_resolved(paths),
            RelayInput::PreimageReceived { preimage } => self.on_preimage(preimage),
            RelayInput::DownstreamSent {
                preimage,
                parts,
                recipient_node_id,
                recipient_amount,
            } => self.on_downstream_sent(preimage, parts, recipient_node_id, recipient_amount),
            RelayInput::DownstreamFailed { failures } => self.on_downstream_failed(failures),
        }
    }

    // ------------------------------------------------------------------
    // Transition handlers
    // ------------------------------------------------------------------

    fn on_htlc_arrived(
        &mut self,
        htlc: IncomingHtlc,
        payment_secret: PaymentSecret,
        height: BlockHeight,
    ) -> ApplyResult {
        if payment_secret != self.payment_secret {
            // The parent routes by (payment_hash, payment_secret); a
            // mismatch here means the routing is broken.
            return ApplyResult {
                events: vec![],
                outputs: vec![RelayOutput::InvariantViolation {
                    message: format!(
                        "payment secret mismatch on inbound HTLC for {}",
                        self.payment_hash
                    ),
                }],
            };
        }

        match &mut self.state {
            RelayState::Receiving { parts, .. } => {
                parts.push(htlc.clone());
                let parts_sum = parts.iter().map(|p| p.amount).sum();
                let parts_count = parts.len();
                ApplyResult {
                    events: vec![RelayEvent::PartReceived {
                        payment_hash: self.payment_hash,
                        channel_id: htlc.channel_id,
                        htlc_id: htlc.htlc_id,
                        amount: htlc.amount,
                        cltv_expiry: htlc.cltv_expiry,
                        parts_count,
                        parts_sum,
                    }],
                    outputs: vec![RelayOutput::ForwardToAggregator { htlc }],
                }
            }
            // The set is closed: reject this part alone, keep the relay going.
            _ => self.reject_stray(htlc.channel_id, htlc.htlc_id, htlc.amount, height),
        }
    }

    fn on_extra_part(
        &mut self,
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
        height: BlockHeight,
    ) -> ApplyResult {
        // The aggregator saw this part race the set completion; drop it from
        // our copy of the set before rejecting it.
        if let RelayState::Receiving { parts, .. } = &mut self.state {
            parts.retain(|p| !(p.channel_id == channel_id && p.htlc_id == htlc_id));
        }
        self.reject_stray(channel_id, htlc_id, amount, height)
    }

    fn on_aggregation_failed(
        &mut self,
        reason: Option<FailureMessage>,
        height: BlockHeight,
    ) -> ApplyResult {
        let parts = match self.take_state() {
            RelayState::Receiving { parts, .. } => parts,
            other => return self.restore(other),
        };

        let amount_in = parts.iter().map(|p| p.amount).sum();
        let reason = reason.unwrap_or(FailureMessage::IncorrectOrUnknownPaymentDetails {
            amount: amount_in,
            height,
        });
        self.reject_all(parts, reason, None)
    }

    fn on_aggregation_succeeded(&mut self, height: BlockHeight) -> ApplyResult {
        let (parts, instructions, next_packet) = match self.take_state() {
            RelayState::Receiving {
                parts,
                instructions,
                next_packet,
            } => (parts, instructions, next_packet),
            other => return self.restore(other),
        };

        let upstream = UpstreamSet::new(parts);
        if let Err(reason) = validate_relay(&upstream, &instructions, &self.config, height) {
            return self.reject_all(upstream.parts, reason, None);
        }

        match instructions {
            RelayInstructions::ToTrampoline(forward)
                if forward.is_async_payment && self.config.async_payments_enabled =>
            {
                let deadline_block = std::cmp::min(
                    height.saturating_add(self.config.async_hold_timeout_blocks),
                    upstream
                        .expiry_in()
                        .saturating_sub(self.config.async_cancel_safety_delta),
                );
                let outgoing_node_id = forward.outgoing_node_id;
                self.state = RelayState::WaitingForAsyncTrigger {
                    upstream,
                    forward,
                    next_packet,
                };
                ApplyResult {
                    events: vec![RelayEvent::WaitingToRelayPayment {
                        outgoing_node_id,
                        payment_hash: self.payment_hash,
                    }],
                    outputs: vec![RelayOutput::WatchAsyncTrigger {
                        outgoing_node_id,
                        deadline_block,
                    }],
                }
            }
            RelayInstructions::ToTrampoline(forward) => {
                self.start_sending_trampoline(upstream, forward, next_packet)
            }
            RelayInstructions::ToBlindedPaths(forward) => {
                let paths = forward.outgoing_blinded_paths.clone();
                self.state = RelayState::ResolvingBlindedPaths { upstream, forward };
                ApplyResult {
                    events: vec![],
                    outputs: vec![RelayOutput::ResolveBlindedPaths { paths }],
                }
            }
        }
    }

    fn on_async_triggered(&mut self) -> ApplyResult {
        let (upstream, forward, next_packet) = match self.take_state() {
            RelayState::WaitingForAsyncTrigger {
                upstream,
                forward,
                next_packet,
            } => (upstream, forward, next_packet),
            other => return self.restore(other),
        };
        self.start_sending_trampoline(upstream, forward, next_packet)
    }

    fn on_async_hold_ended(&mut self) -> ApplyResult {
        let upstream = match self.take_state() {
            RelayState::WaitingForAsyncTrigger { upstream, .. } => upstream,
            other => return self.restore(other),
        };
        self.reject_all(upstream.parts, ASYNC_HOLD_FAILURE, None)
    }

    fn on_paths_resolved(&mut self, paths: Vec<BlindedPath>) -> ApplyResult {
        let (upstream, forward) = match self.take_state() {
            RelayState::ResolvingBlindedPaths { upstream, forward } => (upstream, forward),
            other => return self.restore(other),
        };

        if paths.is_empty() {
            return self.reject_all(upstream.parts, FailureMessage::UnknownNextPeer, None);
        }

        let dispatch = dispatch::blinded_dispatch(
            self.id,
            self.payment_hash,
            &upstream,
            &forward,
            paths,
            &self.config,
        );
        self.state = RelayState::Sending {
            amount_to_forward: forward.amount_to_forward,
            upstream,
            outgoing_node_id: None,
            started_at: Instant::now(),
            fulfilled_upstream: false,
        };
        ApplyResult {
            events: vec![],
            outputs: vec![RelayOutput::SpawnOutbound { dispatch }],
        }
    }

    fn on_preimage(&mut self, preimage: PaymentPreimage) -> ApplyResult {
        let RelayState::Sending {
            upstream,
            fulfilled_upstream,
            ..
        } = &mut self.state
        else {
            return ApplyResult::default();
        };

        if *fulfilled_upstream {
            // Repeated preimage deliveries fulfill at most once.
            return ApplyResult::default();
        }
        *fulfilled_upstream = true;
        ApplyResult {
            events: vec![],
            outputs: vec![RelayOutput::FulfillUpstream {
                parts: upstream.parts.clone(),
                preimage,
            }],
        }
    }

    fn on_downstream_sent(
        &mut self,
        preimage: PaymentPreimage,
        parts: Vec<Msat>,
        recipient_node_id: PublicKey,
        recipient_amount: Msat,
    ) -> ApplyResult {
        let (upstream, started_at, fulfilled_upstream) = match self.take_state() {
            RelayState::Sending {
                upstream,
                started_at,
                fulfilled_upstream,
                ..
            } => (upstream, started_at, fulfilled_upstream),
            other => return self.restore(other),
        };

        let mut outputs = Vec::new();
        if !fulfilled_upstream {
            outputs.push(RelayOutput::FulfillUpstream {
                parts: upstream.parts.clone(),
                preimage,
            });
        }
        outputs.push(RelayOutput::RecordDuration {
            success: true,
            elapsed: started_at.elapsed(),
        });
        outputs.push(RelayOutput::RelayComplete);

        let incoming_parts = upstream
            .parts
            .iter()
            .map(|p| RelayedPart {
                channel_id: p.channel_id,
                htlc_id: p.htlc_id,
                amount: p.amount,
            })
            .collect();
        ApplyResult {
            events: vec![RelayEvent::TrampolinePaymentRelayed {
                payment_hash: self.payment_hash,
                incoming_parts,
                outgoing_parts: parts,
                recipient_node_id,
                recipient_amount,
            }],
            outputs,
        }
    }

    fn on_downstream_failed(&mut self, failures: Vec<DownstreamFailure>) -> ApplyResult {
        let (upstream, outgoing_node_id, amount_to_forward, started_at, fulfilled_upstream) =
            match self.take_state() {
                RelayState::Sending {
                    upstream,
                    outgoing_node_id,
                    amount_to_forward,
                    started_at,
                    fulfilled_upstream,
                } => (
                    upstream,
                    outgoing_node_id,
                    amount_to_forward,
                    started_at,
                    fulfilled_upstream,
                ),
                other => return self.restore(other),
            };

        if fulfilled_upstream {
            // Already claimed upstream: the relay keeps the funds outcome it
            // has; the downstream failure is only an operational detail.
            return ApplyResult {
                events: vec![],
                outputs: vec![
                    RelayOutput::RecordDuration {
                        success: true,
                        elapsed: started_at.elapsed(),
                    },
                    RelayOutput::RelayComplete,
                ],
            };
        }

        let offered_fee = upstream
            .amount_in()
            .checked_sub(amount_to_forward)
            .unwrap_or_default();
        let min_fee = self.config.min_trampoline_fee(amount_to_forward);
        let reason =
            translate_downstream_failures(&failures, outgoing_node_id, offered_fee, min_fee);
        self.reject_all(upstream.parts, reason, Some(started_at))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn start_sending_trampoline(
        &mut self,
        upstream: UpstreamSet,
        forward: TrampolineForward,
        next_packet: Option<NextOnionPacket>,
    ) -> ApplyResult {
        let dispatch = dispatch::trampoline_dispatch(
            self.id,
            self.payment_hash,
            &upstream,
            &forward,
            next_packet,
            &self.config,
        );
        self.state = RelayState::Sending {
            amount_to_forward: forward.amount_to_forward,
            upstream,
            outgoing_node_id: Some(forward.outgoing_node_id),
            started_at: Instant::now(),
            fulfilled_upstream: false,
        };
        ApplyResult {
            events: vec![],
            outputs: vec![RelayOutput::SpawnOutbound { dispatch }],
        }
    }

    /// Fails the whole set upstream and moves to Stopping. `sending_since`
    /// is set when the failure ends a Sending phase, so the duration metric
    /// is recorded exactly once per terminal transition.
    fn reject_all(
        &mut self,
        parts: Vec<IncomingHtlc>,
        reason: FailureMessage,
        sending_since: Option<Instant>,
    ) -> ApplyResult {
        self.state = RelayState::Stopping;
        let mut outputs = vec![
            RelayOutput::FailUpstream { parts, reason },
            RelayOutput::CountFailure {
                class: reason.class_name(),
            },
        ];
        if let Some(started_at) = sending_since {
            outputs.push(RelayOutput::RecordDuration {
                success: false,
                elapsed: started_at.elapsed(),
            });
        }
        outputs.push(RelayOutput::RelayComplete);
        ApplyResult {
            events: vec![RelayEvent::RelayFailed {
                payment_hash: self.payment_hash,
                reason,
            }],
            outputs,
        }
    }

    fn reject_stray(
        &mut self,
        channel_id: ChannelId,
        htlc_id: u64,
        amount: Msat,
        height: BlockHeight,
    ) -> ApplyResult {
        let reason = FailureMessage::IncorrectOrUnknownPaymentDetails { amount, height };
        ApplyResult {
            events: vec![RelayEvent::StrayPartRejected {
                payment_hash: self.payment_hash,
                channel_id,
                htlc_id,
                amount,
            }],
            outputs: vec![
                RelayOutput::FailStray {
                    channel_id,
                    htlc_id,
                    reason,
                },
                RelayOutput::CountFailure {
                    class: reason.class_name(),
                },
            ],
        }
    }

    /// Moves the state out for a by-value transition, leaving Stopping in
    /// its place. Callers either install the successor state or hand the
    /// unmatched state back to [`Relay::restore`].
    fn take_state(&mut self) -> RelayState {
        std::mem::replace(&mut self.state, RelayState::Stopping)
    }

    /// Puts back a state taken by [`Relay::take_state`] that turned out not
    /// to match the input; the stale message is ignored.
    fn restore(&mut self, state: RelayState) -> ApplyResult {
        self.state = state;
        ApplyResult::default()
    }
}

// ============================================================================
// Tests
// ============================================================================
