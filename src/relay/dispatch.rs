//! Construction of the outbound payment dispatch: route budget, recipient
//! selection and the executor configuration.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use rand::Rng;

use crate::config::RelayConfig;
use crate::primitives::{BlockHeight, InvoiceFeatures, Msat, PaymentHash, PaymentSecret, Ppm, RelayId};
use crate::relay::instructions::{
    BlindedForward, BlindedPath, NextOnionPacket, PaymentMetadata, RoutingHint, TrampolineForward,
};
use crate::relay::machine::UpstreamSet;

// ============================================================================
// Dispatch types
// ============================================================================

/// Bounds handed to the router for the downstream route search. The fee
/// budget is purely the flat amount the relay is willing to spend; the
/// proportional component is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteBudget {
    pub max_flat_fee: Msat,
    pub max_proportional_fee: Ppm,
    pub max_cltv_delta: u32,
    pub include_local_channel_cost: bool,
}

/// The downstream recipient of the relayed payment.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRecipient {
    /// A recipient addressed by its real node id: the next trampoline node,
    /// or a non-trampoline final recipient.
    Clear {
        node_id: PublicKey,
        payment_secret: PaymentSecret,
        payment_metadata: Option<PaymentMetadata>,
        invoice_features: Option<InvoiceFeatures>,
        extra_edges: Vec<RoutingHint>,
        /// The re-wrapped onion for the next trampoline node, when this is a
        /// trampoline-to-trampoline forward.
        next_onion: Option<NextOnionPacket>,
    },
    /// A recipient reachable only through resolved blinded paths. `node_id`
    /// is the last blinded node id of the first path and has no relation to
    /// the recipient's real identity.
    Blinded {
        node_id: PublicKey,
        paths: Vec<BlindedPath>,
        invoice_features: InvoiceFeatures,
    },
}

impl OutboundRecipient {
    /// The node id the payment lifecycle will address.
    pub fn node_id(&self) -> PublicKey {
        match self {
            OutboundRecipient::Clear { node_id, .. } => *node_id,
            OutboundRecipient::Blinded { node_id, .. } => *node_id,
        }
    }
}

/// Configuration for the outbound payment executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPaymentConfig {
    /// The relayed attempt is not a node-initiated payment; it must not land
    /// in the payments database.
    pub store_in_db: bool,
    /// Nor does it publish sender-side payment events.
    pub publish_event: bool,
    pub record_path_finding_metrics: bool,
    /// Node id shown in logs and internal listings. The real outgoing node
    /// for trampoline forwards; a random key for blinded forwards so the
    /// true next hop cannot leak.
    pub display_node_id: PublicKey,
    pub max_attempts: u32,
}

/// Everything the outbound executor factory needs to start the downstream
/// attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundDispatch {
    pub relay_id: RelayId,
    pub payment_hash: PaymentHash,
    pub amount: Msat,
    pub expiry: BlockHeight,
    pub recipient: OutboundRecipient,
    pub use_multi_part: bool,
    pub budget: RouteBudget,
    pub config: SendPaymentConfig,
}

// ============================================================================
// Builders
// ============================================================================

/// Generates a random public key with no known secret-key holder, used as a
/// display id when the real recipient must not appear anywhere.
pub fn random_display_node_id() -> PublicKey {
    let secp = Secp256k1::new();
    loop {
        let bytes: [u8; 32] = rand::rng().random();
        // Rejection-samples the negligible set of invalid scalars.
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return PublicKey::from_secret_key(&secp, &secret);
        }
    }
}

fn route_budget(upstream: &UpstreamSet, amount_to_forward: Msat, outgoing_cltv: BlockHeight) -> RouteBudget {
    RouteBudget {
        max_flat_fee: upstream
            .amount_in()
            .checked_sub(amount_to_forward)
            .unwrap_or_default(),
        max_proportional_fee: Ppm::from_ppm(0),
        max_cltv_delta: upstream.expiry_in().saturating_sub(outgoing_cltv),
        include_local_channel_cost: true,
    }
}

/// Builds the dispatch for a `ToTrampoline` forward.
///
/// With a next onion packet and no invoice features this is a pure
/// trampoline-to-trampoline forward: the recipient is the next trampoline
/// node, a fresh random payment secret protects against probing, and
/// multi-part is always allowed. With invoice features present the recipient
/// is the final node and the sender-provided secret and metadata are used.
/// With neither (a legacy sender), the payment goes single-part to the final
/// node.
pub fn trampoline_dispatch(
    relay_id: RelayId,
    payment_hash: PaymentHash,
    upstream: &UpstreamSet,
    forward: &TrampolineForward,
    next_packet: Option<NextOnionPacket>,
    node_config: &RelayConfig,
) -> OutboundDispatch {
    let budget = route_budget(upstream, forward.amount_to_forward, forward.outgoing_cltv);

    let (recipient, use_multi_part) = match (&forward.invoice_features, next_packet) {
        (None, Some(onion)) => (
            OutboundRecipient::Clear {
                node_id: forward.outgoing_node_id,
                payment_secret: PaymentSecret::random(),
                payment_metadata: None,
                invoice_features: None,
                extra_edges: vec![],
                next_onion: Some(onion),
            },
            true,
        ),
        (Some(features), _) => {
            let use_multi_part = features.supports_basic_mpp();
            (
                OutboundRecipient::Clear {
                    node_id: forward.outgoing_node_id,
                    // Presence is guaranteed by validation.
                    payment_secret: forward.payment_secret.unwrap_or_else(PaymentSecret::random),
                    payment_metadata: forward.payment_metadata.clone(),
                    invoice_features: Some(features.clone()),
                    extra_edges: forward.invoice_routing_info.clone(),
                    next_onion: None,
                },
                use_multi_part,
            )
        }
        (None, None) => (
            OutboundRecipient::Clear {
                node_id: forward.outgoing_node_id,
                payment_secret: forward.payment_secret.unwrap_or_else(PaymentSecret::random),
                payment_metadata: forward.payment_metadata.clone(),
                invoice_features: None,
                extra_edges: vec![],
                next_onion: None,
            },
            false,
        ),
    };

    OutboundDispatch {
        relay_id,
        payment_hash,
        amount: forward.amount_to_forward,
        expiry: forward.outgoing_cltv,
        recipient,
        use_multi_part,
        budget,
        config: SendPaymentConfig {
            store_in_db: false,
            publish_event: false,
            record_path_finding_metrics: true,
            display_node_id: forward.outgoing_node_id,
            max_attempts: node_config.max_payment_attempts,
        },
    }
}

/// Builds the dispatch for a `ToBlindedPaths` forward, after the compact
/// introduction nodes have been resolved. `resolved` must be non-empty.
pub fn blinded_dispatch(
    relay_id: RelayId,
    payment_hash: PaymentHash,
    upstream: &UpstreamSet,
    forward: &BlindedForward,
    resolved: Vec<BlindedPath>,
    node_config: &RelayConfig,
) -> OutboundDispatch {
    let budget = route_budget(upstream, forward.amount_to_forward, forward.outgoing_cltv);
    let node_id = resolved[0].last_blinded_id();
    let use_multi_part = forward.invoice_features.supports_basic_mpp();

    OutboundDispatch {
        relay_id,
        payment_hash,
        amount: forward.amount_to_forward,
        expiry: forward.outgoing_cltv,
        recipient: OutboundRecipient::Blinded {
            node_id,
            paths: resolved,
            invoice_features: forward.invoice_features.clone(),
        },
        use_multi_part,
        budget,
        config: SendPaymentConfig {
            store_in_db: false,
            publish_event: false,
            record_path_finding_metrics: true,
            display_node_id: random_display_node_id(),
            max_attempts: node_config.max_payment_attempts,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::ChannelId;
    use crate::relay::machine::IncomingHtlc;

    fn node_id() -> PublicKey {
        "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
            .parse()
            .unwrap()
    }

    fn blinded_id() -> PublicKey {
        "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
            .parse()
            .unwrap()
    }

    fn upstream() -> UpstreamSet {
        UpstreamSet::new(vec![
            IncomingHtlc {
                htlc_id: 0,
                channel_id: ChannelId([1u8; 32]),
                amount: Msat(600_000),
                cltv_expiry: 800_100,
                received_at: chrono::Utc::now(),
            },
            IncomingHtlc {
                htlc_id: 1,
                channel_id: ChannelId([1u8; 32]),
                amount: Msat(400_000),
                cltv_expiry: 800_090,
                received_at: chrono::Utc::now(),
            },
        ])
    }

    fn trampoline_forward() -> TrampolineForward {
        TrampolineForward {
            outgoing_node_id: node_id(),
            amount_to_forward: Msat(990_000),
            outgoing_cltv: 800_040,
            invoice_features: None,
            invoice_routing_info: vec![],
            payment_secret: None,
            payment_metadata: None,
            is_async_payment: false,
        }
    }

    #[test]
    fn test_route_budget_bounds() {
        let dispatch = trampoline_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &trampoline_forward(),
            Some(NextOnionPacket(vec![0u8; 400])),
            &RelayConfig::default(),
        );

        assert_eq!(dispatch.budget.max_flat_fee, Msat(10_000));
        assert_eq!(dispatch.budget.max_proportional_fee, Ppm::from_ppm(0));
        // min expiry 800_090 minus outgoing 800_040.
        assert_eq!(dispatch.budget.max_cltv_delta, 50);
        assert!(dispatch.budget.include_local_channel_cost);
    }

    #[test]
    fn test_trampoline_to_trampoline_uses_fresh_secret_and_mpp() {
        let incoming_secret = PaymentSecret([0xAA; 32]);
        let dispatch = trampoline_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &trampoline_forward(),
            Some(NextOnionPacket(vec![0u8; 400])),
            &RelayConfig::default(),
        );

        assert!(dispatch.use_multi_part);
        match &dispatch.recipient {
            OutboundRecipient::Clear {
                payment_secret,
                next_onion,
                invoice_features,
                ..
            } => {
                assert_ne!(*payment_secret, incoming_secret);
                assert!(next_onion.is_some());
                assert!(invoice_features.is_none());
            }
            other => panic!("expected clear recipient, got {:?}", other),
        }
        assert_eq!(dispatch.config.display_node_id, node_id());
        assert!(!dispatch.config.store_in_db);
        assert!(!dispatch.config.publish_event);
        assert!(dispatch.config.record_path_finding_metrics);
    }

    #[test]
    fn test_fresh_secrets_differ_between_dispatches() {
        let build = || {
            trampoline_dispatch(
                RelayId(1),
                PaymentHash([2u8; 32]),
                &upstream(),
                &trampoline_forward(),
                Some(NextOnionPacket(vec![])),
                &RelayConfig::default(),
            )
        };
        let secret_of = |d: &OutboundDispatch| match &d.recipient {
            OutboundRecipient::Clear { payment_secret, .. } => *payment_secret,
            _ => unreachable!(),
        };
        assert_ne!(secret_of(&build()), secret_of(&build()));
    }

    #[test]
    fn test_non_trampoline_recipient_uses_sender_secret() {
        let sender_secret = PaymentSecret([0x55; 32]);
        let hint = RoutingHint {
            node_id: blinded_id(),
            short_channel_id: 42,
            fee_base: Msat(1),
            fee_proportional: Ppm::from_ppm(100),
            cltv_expiry_delta: 40,
        };
        let forward = TrampolineForward {
            invoice_features: Some(InvoiceFeatures::basic_mpp_optional()),
            invoice_routing_info: vec![hint.clone()],
            payment_secret: Some(sender_secret),
            payment_metadata: Some(PaymentMetadata(vec![1, 2, 3])),
            ..trampoline_forward()
        };
        let dispatch = trampoline_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &forward,
            None,
            &RelayConfig::default(),
        );

        assert!(dispatch.use_multi_part);
        match &dispatch.recipient {
            OutboundRecipient::Clear {
                payment_secret,
                payment_metadata,
                extra_edges,
                next_onion,
                ..
            } => {
                assert_eq!(*payment_secret, sender_secret);
                assert_eq!(*payment_metadata, Some(PaymentMetadata(vec![1, 2, 3])));
                assert_eq!(extra_edges, &vec![hint]);
                assert!(next_onion.is_none());
            }
            other => panic!("expected clear recipient, got {:?}", other),
        }
    }

    #[test]
    fn test_non_mpp_invoice_disables_multi_part() {
        let forward = TrampolineForward {
            invoice_features: Some(InvoiceFeatures::default()),
            payment_secret: Some(PaymentSecret([0x55; 32])),
            ..trampoline_forward()
        };
        let dispatch = trampoline_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &forward,
            None,
            &RelayConfig::default(),
        );
        assert!(!dispatch.use_multi_part);
    }

    #[test]
    fn test_legacy_forward_is_single_part() {
        // Neither invoice features nor a next onion: legacy sender.
        let dispatch = trampoline_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &trampoline_forward(),
            None,
            &RelayConfig::default(),
        );
        assert!(!dispatch.use_multi_part);
        assert!(matches!(
            dispatch.recipient,
            OutboundRecipient::Clear { next_onion: None, .. }
        ));
    }

    #[test]
    fn test_blinded_dispatch_hides_recipient() {
        let forward = BlindedForward {
            amount_to_forward: Msat(990_000),
            outgoing_cltv: 800_040,
            invoice_features: InvoiceFeatures::basic_mpp_optional(),
            outgoing_blinded_paths: vec![],
        };
        let path = BlindedPath {
            introduction_node_id: node_id(),
            blinding_point: node_id(),
            blinded_node_ids: vec![node_id(), blinded_id()],
        };
        let dispatch = blinded_dispatch(
            RelayId(1),
            PaymentHash([2u8; 32]),
            &upstream(),
            &forward,
            vec![path],
            &RelayConfig::default(),
        );

        assert!(dispatch.use_multi_part);
        // Recipient is addressed by the last blinded id of the first path.
        assert_eq!(dispatch.recipient.node_id(), blinded_id());
        // The display id must not be any id from the path.
        assert_ne!(dispatch.config.display_node_id, blinded_id());
        assert_ne!(dispatch.config.display_node_id, node_id());
    }

    #[test]
    fn test_random_display_node_ids_differ() {
        assert_ne!(random_display_node_id(), random_display_node_id());
    }
}
