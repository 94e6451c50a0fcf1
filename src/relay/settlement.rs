//! Upstream HTLC settlement.
//!
//! Settlement commands are the only durable artifact of a relay: each
//! command is persisted to the pending-commands store before it is handed
//! to the channel register, so a crash between persistence and register
//! acknowledgement still leads to eventual delivery. The store deduplicates
//! retries by `(channel_id, htlc_id)`; the relay itself is never
//! checkpointed.

use std::sync::Arc;

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::failure::FailureMessage;
use crate::primitives::{ChannelId, PaymentPreimage};
use crate::provider::{ChannelRegister, PendingCommandStore};
use crate::relay::machine::IncomingHtlc;

// ============================================================================
// Commands
// ============================================================================

/// A settlement command for one upstream HTLC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementCommand {
    Fulfill {
        channel_id: ChannelId,
        htlc_id: u64,
        preimage: PaymentPreimage,
        commit: bool,
    },
    Fail {
        channel_id: ChannelId,
        htlc_id: u64,
        reason: FailureMessage,
        commit: bool,
    },
}

impl SettlementCommand {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            SettlementCommand::Fulfill { channel_id, .. } => *channel_id,
            SettlementCommand::Fail { channel_id, .. } => *channel_id,
        }
    }

    pub fn htlc_id(&self) -> u64 {
        match self {
            SettlementCommand::Fulfill { htlc_id, .. } => *htlc_id,
            SettlementCommand::Fail { htlc_id, .. } => *htlc_id,
        }
    }
}

/// A settlement command as stored in the pending-commands store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command: SettlementCommand,
    /// Unix epoch seconds at which the command was recorded.
    pub recorded_at_epoch: u64,
}

impl PendingCommand {
    pub fn new(command: SettlementCommand) -> Self {
        let recorded_at_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            command,
            recorded_at_epoch,
        }
    }
}

// ============================================================================
// Settler
// ============================================================================

/// Applies settlement commands with persist-then-send semantics.
#[derive(Clone)]
pub struct UpstreamSettler {
    store: Arc<dyn PendingCommandStore>,
    register: Arc<dyn ChannelRegister>,
}

impl UpstreamSettler {
    pub fn new(store: Arc<dyn PendingCommandStore>, register: Arc<dyn ChannelRegister>) -> Self {
        Self { store, register }
    }

    /// Fulfills every HTLC of the set with the preimage.
    pub async fn fulfill_set(
        &self,
        parts: &[IncomingHtlc],
        preimage: PaymentPreimage,
    ) -> Result<()> {
        for part in parts {
            self.safe_send(SettlementCommand::Fulfill {
                channel_id: part.channel_id,
                htlc_id: part.htlc_id,
                preimage,
                commit: true,
            })
            .await?;
        }
        Ok(())
    }

    /// Fails every HTLC of the set with the same reason.
    pub async fn fail_set(&self, parts: &[IncomingHtlc], reason: FailureMessage) -> Result<()> {
        for part in parts {
            self.safe_send(SettlementCommand::Fail {
                channel_id: part.channel_id,
                htlc_id: part.htlc_id,
                reason,
                commit: true,
            })
            .await?;
        }
        Ok(())
    }

    /// Fails a single HTLC, used for strays outside the accepted set.
    pub async fn fail_one(
        &self,
        channel_id: ChannelId,
        htlc_id: u64,
        reason: FailureMessage,
    ) -> Result<()> {
        self.safe_send(SettlementCommand::Fail {
            channel_id,
            htlc_id,
            reason,
            commit: true,
        })
        .await
    }

    /// Persist first, then hand to the register. If the register send fails
    /// the command is already durable and will be re-sent on recovery, so
    /// the error is logged rather than propagated.
    async fn safe_send(&self, command: SettlementCommand) -> Result<()> {
        let pending = PendingCommand::new(command.clone());
        self.store.persist(&pending).await?;
        if let Err(e) = self.register.send_command(&command).await {
            warn!(
                "register send failed for channel={} htlc={}, relying on replay: {}",
                command.channel_id(),
                command.htlc_id(),
                e
            );
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::Msat;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        persisted: Mutex<Vec<PendingCommand>>,
    }

    #[async_trait]
    impl PendingCommandStore for RecordingStore {
        async fn persist(&self, command: &PendingCommand) -> Result<()> {
            self.persisted.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRegister {
        sent: Mutex<Vec<SettlementCommand>>,
        fail_sends: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ChannelRegister for RecordingRegister {
        async fn send_command(&self, command: &SettlementCommand) -> Result<()> {
            if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("register unavailable");
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    fn parts() -> Vec<IncomingHtlc> {
        vec![
            IncomingHtlc {
                htlc_id: 1,
                channel_id: ChannelId([1u8; 32]),
                amount: Msat(600_000),
                cltv_expiry: 800_100,
                received_at: chrono::Utc::now(),
            },
            IncomingHtlc {
                htlc_id: 5,
                channel_id: ChannelId([2u8; 32]),
                amount: Msat(400_000),
                cltv_expiry: 800_090,
                received_at: chrono::Utc::now(),
            },
        ]
    }

    #[tokio::test]
    async fn test_fulfill_set_persists_then_sends_each_part() {
        let store = Arc::new(RecordingStore::default());
        let register = Arc::new(RecordingRegister::default());
        let settler = UpstreamSettler::new(store.clone(), register.clone());

        let preimage = PaymentPreimage([9u8; 32]);
        settler.fulfill_set(&parts(), preimage).await.unwrap();

        let persisted = store.persisted.lock().unwrap();
        let sent = register.sent.lock().unwrap();
        assert_eq!(persisted.len(), 2);
        assert_eq!(sent.len(), 2);
        for (p, s) in persisted.iter().zip(sent.iter()) {
            assert_eq!(&p.command, s);
            assert!(matches!(
                s,
                SettlementCommand::Fulfill { commit: true, .. }
            ));
        }
        assert_eq!(sent[0].htlc_id(), 1);
        assert_eq!(sent[1].htlc_id(), 5);
    }

    #[tokio::test]
    async fn test_fail_set_uses_same_reason_for_all() {
        let store = Arc::new(RecordingStore::default());
        let register = Arc::new(RecordingRegister::default());
        let settler = UpstreamSettler::new(store.clone(), register.clone());

        settler
            .fail_set(&parts(), FailureMessage::TrampolineFeeInsufficient)
            .await
            .unwrap();

        let sent = register.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for cmd in sent.iter() {
            assert!(matches!(
                cmd,
                SettlementCommand::Fail {
                    reason: FailureMessage::TrampolineFeeInsufficient,
                    commit: true,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_register_failure_after_persist_is_not_fatal() {
        let store = Arc::new(RecordingStore::default());
        let register = Arc::new(RecordingRegister::default());
        register
            .fail_sends
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let settler = UpstreamSettler::new(store.clone(), register.clone());

        // The command is durable; the send error is swallowed.
        settler
            .fail_one(ChannelId([3u8; 32]), 8, FailureMessage::TemporaryNodeFailure)
            .await
            .unwrap();

        assert_eq!(store.persisted.lock().unwrap().len(), 1);
        assert!(register.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pending_command_serde_round_trip() {
        let pending = PendingCommand::new(SettlementCommand::Fulfill {
            channel_id: ChannelId([1u8; 32]),
            htlc_id: 42,
            preimage: PaymentPreimage([9u8; 32]),
            commit: true,
        });
        let json = serde_json::to_string(&pending).unwrap();
        let back: PendingCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pending);
    }
}
