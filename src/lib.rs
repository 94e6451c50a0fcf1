//! Trampoline node-relay core.
//!
//! This crate implements the per-payment relay machinery of a Lightning node
//! acting as a trampoline hop: it aggregates an inbound multi-part HTLC set,
//! validates the decrypted relay instructions, dispatches an outbound payment
//! one hop further along the trampoline chain (or to a clear or blinded final
//! recipient), and settles the upstream HTLCs under Lightning's atomicity
//! rules.
//!
//! The design separates a pure state machine ([`relay::machine`]) from the
//! asynchronous plumbing around it: each relay instance runs as a task that
//! consumes typed messages from a private mailbox ([`relay::actor`]), and a
//! parent dispatcher keyed by `(payment_hash, payment_secret)` guarantees
//! exactly one live instance per payment ([`relay::dispatcher`]). All
//! collaborators of the core (router, channel register, event bus, metrics,
//! async-payment triggerer, blinded-path resolver) are reached through the
//! traits in [`provider`].

pub mod config;
pub mod failure;
pub mod primitives;
pub mod provider;
pub mod relay;
