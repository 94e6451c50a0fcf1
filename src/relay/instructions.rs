//! Decrypted inner relay instructions, as handed over by the onion layer.

use bitcoin::secp256k1::PublicKey;

use crate::primitives::{BlockHeight, InvoiceFeatures, Msat, PaymentSecret, Ppm};

/// The onion packet to forward to the next trampoline node, re-wrapped by
/// the onion layer. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextOnionPacket(pub Vec<u8>);

/// Opaque payment metadata the sender asked us to attach for the final
/// recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentMetadata(pub Vec<u8>);

/// One extra routing edge derived from the invoice routing info, letting the
/// router reach a recipient that is not in the public graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHint {
    pub node_id: PublicKey,
    pub short_channel_id: u64,
    pub fee_base: Msat,
    pub fee_proportional: Ppm,
    pub cltv_expiry_delta: u16,
}

/// How the introduction node of a compact blinded path is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntroductionNode {
    /// Referenced by its real node id; no resolution needed.
    NodeId(PublicKey),
    /// Referenced compactly by a short channel id and direction; must be
    /// resolved against the channel graph before use.
    Channel { short_channel_id: u64, direction: bool },
}

/// A blinded path as decoded from the onion, possibly with a compact
/// introduction that still needs resolving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlindedPath {
    pub introduction: IntroductionNode,
    pub blinding_point: PublicKey,
    pub blinded_node_ids: Vec<PublicKey>,
}

/// A fully resolved blinded path, ready for route computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlindedPath {
    pub introduction_node_id: PublicKey,
    pub blinding_point: PublicKey,
    pub blinded_node_ids: Vec<PublicKey>,
}

impl BlindedPath {
    /// The last blinded node id, standing in for the recipient.
    pub fn last_blinded_id(&self) -> PublicKey {
        *self
            .blinded_node_ids
            .last()
            .unwrap_or(&self.introduction_node_id)
    }
}

/// Instructions for forwarding to a next trampoline node or, when
/// `invoice_features` is present, to a non-trampoline final recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct TrampolineForward {
    pub outgoing_node_id: PublicKey,
    pub amount_to_forward: Msat,
    pub outgoing_cltv: BlockHeight,
    /// Present when the recipient does not understand trampoline onions and
    /// we must compute the final route ourselves.
    pub invoice_features: Option<InvoiceFeatures>,
    pub invoice_routing_info: Vec<RoutingHint>,
    pub payment_secret: Option<PaymentSecret>,
    pub payment_metadata: Option<PaymentMetadata>,
    pub is_async_payment: bool,
}

/// Instructions for forwarding to a recipient reachable only through
/// blinded paths.
#[derive(Debug, Clone, PartialEq)]
pub struct BlindedForward {
    pub amount_to_forward: Msat,
    pub outgoing_cltv: BlockHeight,
    pub invoice_features: InvoiceFeatures,
    pub outgoing_blinded_paths: Vec<CompactBlindedPath>,
}

/// The decrypted inner payload of the trampoline onion.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayInstructions {
    ToTrampoline(TrampolineForward),
    ToBlindedPaths(BlindedForward),
}

impl RelayInstructions {
    pub fn amount_to_forward(&self) -> Msat {
        match self {
            RelayInstructions::ToTrampoline(f) => f.amount_to_forward,
            RelayInstructions::ToBlindedPaths(f) => f.amount_to_forward,
        }
    }

    pub fn outgoing_cltv(&self) -> BlockHeight {
        match self {
            RelayInstructions::ToTrampoline(f) => f.outgoing_cltv,
            RelayInstructions::ToBlindedPaths(f) => f.outgoing_cltv,
        }
    }
}
