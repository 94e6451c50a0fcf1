//! Relay validation: fee, expiry and payload checks run once the inbound
//! multi-part set is complete, before anything is sent downstream.

use crate::config::RelayConfig;
use crate::failure::FailureMessage;
use crate::primitives::BlockHeight;
use crate::relay::instructions::RelayInstructions;
use crate::relay::machine::UpstreamSet;

/// Validates the relay instructions against the completed upstream set.
///
/// Checks run in a fixed order; the first failing check determines the
/// failure returned to the sender:
///
/// 1. the fee left for us covers our minimum trampoline fee,
/// 2. the expiry delta left for us covers our channel expiry delta,
/// 3. the outgoing expiry is not already in the past,
/// 4. the forwarded amount is positive,
/// 5. a payment secret is present when forwarding to a non-trampoline
///    recipient.
pub fn validate_relay(
    upstream: &UpstreamSet,
    instructions: &RelayInstructions,
    config: &RelayConfig,
    height: BlockHeight,
) -> Result<(), FailureMessage> {
    let amount_to_forward = instructions.amount_to_forward();
    let outgoing_cltv = instructions.outgoing_cltv();

    let fee = upstream.amount_in().checked_sub(amount_to_forward);
    match fee {
        Some(fee) if fee >= config.min_trampoline_fee(amount_to_forward) => {}
        _ => return Err(FailureMessage::TrampolineFeeInsufficient),
    }

    let expiry_delta = upstream.expiry_in().checked_sub(outgoing_cltv);
    match expiry_delta {
        Some(delta) if delta >= config.channel_expiry_delta => {}
        _ => return Err(FailureMessage::TrampolineExpiryTooSoon),
    }

    if outgoing_cltv <= height {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }

    if amount_to_forward.msat() == 0 {
        return Err(FailureMessage::InvalidOnionPayload { tag: 2, offset: 0 });
    }

    if let RelayInstructions::ToTrampoline(forward) = instructions {
        if forward.invoice_features.is_some() && forward.payment_secret.is_none() {
            return Err(FailureMessage::InvalidOnionPayload { tag: 8, offset: 0 });
        }
    }

    Ok(())
}
