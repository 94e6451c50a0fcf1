//! Upstream-visible BOLT-4 failure messages and downstream failure
//! translation.
//!
//! The relay never invents failure codes: validation and aggregation errors
//! map onto the trampoline failure set, and downstream payment failures are
//! translated by the rules in [`translate_downstream_failures`]. Once an
//! upstream fulfill has happened, no failure is ever surfaced upstream; the
//! caller enforces that, not this module.

use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::primitives::{BlockHeight, Msat};

// ============================================================================
// Upstream failure messages
// ============================================================================

/// BOLT-4 failure message returned as the HTLC fail reason upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureMessage {
    /// The fee offered to this trampoline node is below its policy.
    TrampolineFeeInsufficient,
    /// The expiry delta left for this trampoline node is below its policy,
    /// or the outgoing expiry is already in the past.
    TrampolineExpiryTooSoon,
    /// A required field of the inner payload is missing or invalid.
    InvalidOnionPayload { tag: u64, offset: usize },
    /// Generic recipient-side rejection; also the default reason when the
    /// multi-part set never completes.
    IncorrectOrUnknownPaymentDetails {
        amount: Msat,
        height: BlockHeight,
    },
    /// Transient failure of this node.
    TemporaryNodeFailure,
    /// The requested next peer cannot be reached.
    UnknownNextPeer,
}

impl FailureMessage {
    /// Snake-case class name, used to tag the relay-failure counter.
    pub fn class_name(&self) -> &'static str {
        match self {
            FailureMessage::TrampolineFeeInsufficient => "trampoline_fee_insufficient",
            FailureMessage::TrampolineExpiryTooSoon => "trampoline_expiry_too_soon",
            FailureMessage::InvalidOnionPayload { .. } => "invalid_onion_payload",
            FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => {
                "incorrect_or_unknown_payment_details"
            }
            FailureMessage::TemporaryNodeFailure => "temporary_node_failure",
            FailureMessage::UnknownNextPeer => "unknown_next_peer",
        }
    }
}

impl std::fmt::Display for FailureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMessage::InvalidOnionPayload { tag, offset } => {
                write!(f, "invalid_onion_payload: tag={}, offset={}", tag, offset)
            }
            FailureMessage::IncorrectOrUnknownPaymentDetails { amount, height } => {
                write!(
                    f,
                    "incorrect_or_unknown_payment_details: amount={}, height={}",
                    amount, height
                )
            }
            other => write!(f, "{}", other.class_name()),
        }
    }
}

/// Failure returned upstream when an async-payment hold times out or is
/// canceled. Centralised here because the BOLT failure code for this case is
/// still provisional; update this constant once a code is assigned.
pub const ASYNC_HOLD_FAILURE: FailureMessage = FailureMessage::TemporaryNodeFailure;

// ============================================================================
// Downstream failures
// ============================================================================

/// A failure produced locally by the outbound payment executor, before any
/// HTLC reached the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFailureKind {
    /// A direct channel exists but lacks outgoing liquidity.
    BalanceTooLow,
    /// The router found no route within the budget.
    RouteNotFound,
    /// Any other local error (channel unavailable, disconnection, ...).
    Other,
}

/// One failure from a downstream payment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamFailure {
    /// The attempt failed before leaving this node.
    Local { kind: LocalFailureKind },
    /// A decrypted failure message from a remote node.
    Remote {
        origin: PublicKey,
        message: FailureMessage,
    },
    /// A failure that could not be attributed or decrypted.
    Unreadable,
}

/// Fee-budget multiple above which a `BalanceTooLow` is reported as a node
/// failure instead of a fee problem: the sender already offered several times
/// our minimum fee, so a bigger budget will not unlock a route.
const BALANCE_TOO_LOW_FEE_RATIO: u64 = 5;

/// Synthesises the BOLT-4 message to return upstream from the downstream
/// failure list.
///
/// `outgoing_node_id` is the declared next trampoline node for
/// [`ToTrampoline`](crate::relay::instructions::RelayInstructions) relays and
/// `None` for blinded-path relays, which must never surface a remote failure
/// (the sender could use it to probe past the introduction node).
pub fn translate_downstream_failures(
    failures: &[DownstreamFailure],
    outgoing_node_id: Option<PublicKey>,
    offered_fee: Msat,
    min_fee: Msat,
) -> FailureMessage {
    // An empty list should not occur; treat it as a transient node failure.
    let only = match failures {
        [] => return FailureMessage::TemporaryNodeFailure,
        [single] => Some(single),
        _ => None,
    };

    if let Some(DownstreamFailure::Local {
        kind: LocalFailureKind::BalanceTooLow,
    }) = only
    {
        return if offered_fee.msat() >= BALANCE_TOO_LOW_FEE_RATIO * min_fee.msat() {
            FailureMessage::TemporaryNodeFailure
        } else {
            FailureMessage::TrampolineFeeInsufficient
        };
    }

    let route_not_found = failures.iter().any(|f| {
        matches!(
            f,
            DownstreamFailure::Local {
                kind: LocalFailureKind::RouteNotFound
            }
        )
    });
    if route_not_found {
        return FailureMessage::TrampolineFeeInsufficient;
    }

    let Some(outgoing_node_id) = outgoing_node_id else {
        // Blinded relay: nothing from the remote side may leak upstream.
        return FailureMessage::TemporaryNodeFailure;
    };

    let from_outgoing = failures.iter().find_map(|f| match f {
        DownstreamFailure::Remote { origin, message } if *origin == outgoing_node_id => {
            Some(*message)
        }
        _ => None,
    });
    let any_remote = failures.iter().find_map(|f| match f {
        DownstreamFailure::Remote { message, .. } => Some(*message),
        _ => None,
    });

    from_outgoing
        .or(any_remote)
        .unwrap_or(FailureMessage::TemporaryNodeFailure)
}

// ============================================================================
// Tests
// ============================================================================
