//! Node-level configuration for the relay core.

use crate::primitives::{Msat, Ppm};

/// Relay policy configuration, shared immutably by all relay instances.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Flat fee required for relaying, in msat.
    pub fee_base: Msat,

    /// Proportional fee required for relaying, over the forwarded amount.
    pub fee_proportional: Ppm,

    /// Minimum CLTV delta we keep between the incoming and outgoing expiry.
    pub channel_expiry_delta: u32,

    /// Whether this node advertises the async-payment feature. When unset,
    /// payments flagged as async are relayed immediately.
    pub async_payments_enabled: bool,

    /// Upper bound, in blocks from now, on how long an async payment is held
    /// waiting for the peer-ready trigger.
    pub async_hold_timeout_blocks: u32,

    /// Safety margin, in blocks, kept between the async hold deadline and the
    /// expiry of the incoming HTLC set.
    pub async_cancel_safety_delta: u32,

    /// Maximum number of attempts the outbound executor may make.
    pub max_payment_attempts: u32,
}

impl RelayConfig {
    /// The minimum trampoline fee this node requires to forward `amount`.
    pub fn min_trampoline_fee(&self, amount: Msat) -> Msat {
        Msat(self.fee_base.msat() + self.fee_proportional.apply_to(amount.msat()))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fee_base: Msat::from_msat(1_000),
            fee_proportional: Ppm::from_ppm(0),
            channel_expiry_delta: 144,
            async_payments_enabled: false,
            async_hold_timeout_blocks: 1008,
            async_cancel_safety_delta: 144,
            max_payment_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_trampoline_fee_flat_only() {
        let config = RelayConfig::default();
        assert_eq!(config.min_trampoline_fee(Msat(990_000)), Msat(1_000));
    }

    #[test]
    fn test_min_trampoline_fee_with_proportional() {
        let config = RelayConfig {
            fee_proportional: Ppm::from_ppm(1_000),
            ..RelayConfig::default()
        };
        // 1_000 flat + 0.1% of 1_000_000.
        assert_eq!(config.min_trampoline_fee(Msat(1_000_000)), Msat(2_000));
    }
}
