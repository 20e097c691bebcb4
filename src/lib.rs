//! Hub node - payment-channel network coordination core
//!
//! The server-side hub of a two-party payment-channel network. It
//! counter-signs and mediates off-chain balance updates between many
//! independent user channels without ever holding user funds outside an
//! on-chain multisig escrow, moving a payment from user A to user B through
//! two linked conditional transfers (A→hub, hub→B) resolved atomically via a
//! shared secret.
//!
//! ## Subsystems
//!
//! 1. **Lock service** - distributed mutual exclusion keyed by channel or
//!    transfer, FIFO waiters, TTL deadlock recovery
//! 2. **Collateral engine** - per-channel, per-asset rebalancing of the
//!    hub's free balance (deposit on demand, reclaim excess)
//! 3. **Conditional transfer engine** - one parameterized state machine for
//!    hash-preimage, timelocked, and signed-secret transfers
//!
//! The protocol engine (handshakes, commitments), durable persistence, the
//! messaging transport, and on-chain submission are external collaborators
//! reached through the traits in [`protocol`] and [`channel::repository`].

pub mod channel;
pub mod collateral;
pub mod config;
pub mod lock;
pub mod node;
pub mod protocol;
pub mod rpc;
pub mod transfer;
pub mod types;
pub mod utils;

pub use config::HubConfig;
pub use types::{Amount, AssetId, Bytes32, PaymentId};

use crate::channel::{
    AppRepository, ChannelRepository, MemoryAppRepository, MemoryChannelRepository,
    MemoryTransferRepository, TransferRepository,
};
use crate::collateral::{CollateralEngine, RebalanceTargetSource};
use crate::lock::{LockService, LockStore, MemoryLockStore};
use crate::node::ChannelEventDispatcher;
use crate::protocol::ProtocolClient;
use crate::rpc::{LockRpc, TransferRpc};
use crate::transfer::ConditionalTransferEngine;
use std::sync::Arc;

/// Assembled hub node.
pub struct HubNode {
    config: HubConfig,
    lock_service: Arc<LockService>,
    collateral_engine: Arc<CollateralEngine>,
    transfer_engine: Arc<ConditionalTransferEngine>,
    event_dispatcher: Arc<ChannelEventDispatcher>,
}

impl HubNode {
    /// Start building a hub node around a protocol client.
    pub fn builder(config: HubConfig, protocol: Arc<dyn ProtocolClient>) -> HubNodeBuilder {
        HubNodeBuilder {
            config,
            protocol,
            lock_store: None,
            channel_repo: None,
            transfer_repo: None,
            app_repo: None,
            target_source: None,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn lock_service(&self) -> Arc<LockService> {
        Arc::clone(&self.lock_service)
    }

    pub fn collateral_engine(&self) -> Arc<CollateralEngine> {
        Arc::clone(&self.collateral_engine)
    }

    pub fn transfer_engine(&self) -> Arc<ConditionalTransferEngine> {
        Arc::clone(&self.transfer_engine)
    }

    /// Dispatch surface for the protocol event listener.
    pub fn event_dispatcher(&self) -> Arc<ChannelEventDispatcher> {
        Arc::clone(&self.event_dispatcher)
    }

    /// Transfer endpoint handler for the messaging layer.
    pub fn transfer_rpc(&self) -> TransferRpc {
        TransferRpc::new(self.transfer_engine())
    }

    /// Lock endpoint handler for the messaging layer.
    pub fn lock_rpc(&self) -> LockRpc {
        LockRpc::new(self.lock_service())
    }
}

/// Builder wiring the engines to their collaborators. In-memory backends
/// are the defaults; production deployments swap in shared-store and
/// relational implementations.
pub struct HubNodeBuilder {
    config: HubConfig,
    protocol: Arc<dyn ProtocolClient>,
    lock_store: Option<Arc<dyn LockStore>>,
    channel_repo: Option<Arc<dyn ChannelRepository>>,
    transfer_repo: Option<Arc<dyn TransferRepository>>,
    app_repo: Option<Arc<dyn AppRepository>>,
    target_source: Option<Arc<dyn RebalanceTargetSource>>,
}

impl HubNodeBuilder {
    /// Use a process-external lock store (multi-instance deployments).
    pub fn with_lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    pub fn with_channel_repository(mut self, repo: Arc<dyn ChannelRepository>) -> Self {
        self.channel_repo = Some(repo);
        self
    }

    pub fn with_transfer_repository(mut self, repo: Arc<dyn TransferRepository>) -> Self {
        self.transfer_repo = Some(repo);
        self
    }

    pub fn with_app_repository(mut self, repo: Arc<dyn AppRepository>) -> Self {
        self.app_repo = Some(repo);
        self
    }

    /// Attach a live rebalancing-recommendation source.
    pub fn with_rebalance_target_source(mut self, source: Arc<dyn RebalanceTargetSource>) -> Self {
        self.target_source = Some(source);
        self
    }

    pub fn build(self) -> anyhow::Result<HubNode> {
        self.config.validate()?;
        let default_profile = self.config.default_rebalance_profile("")?;

        let lock_store = self
            .lock_store
            .unwrap_or_else(|| Arc::new(MemoryLockStore::new()));
        let channel_repo = self
            .channel_repo
            .unwrap_or_else(|| Arc::new(MemoryChannelRepository::new()));
        let transfer_repo = self
            .transfer_repo
            .unwrap_or_else(|| Arc::new(MemoryTransferRepository::new()));
        let app_repo = self
            .app_repo
            .unwrap_or_else(|| Arc::new(MemoryAppRepository::new()));

        let lock_service = Arc::new(LockService::new(lock_store, self.config.lock.clone()));

        let mut collateral_engine = CollateralEngine::new(
            Arc::clone(&channel_repo),
            Arc::clone(&self.protocol),
            self.config.node_identifier.clone(),
            &self.config.collateral,
            &self.config.retry,
            Some(default_profile),
        );
        if let Some(source) = self.target_source {
            collateral_engine = collateral_engine.with_target_source(source);
        }
        let collateral_engine = Arc::new(collateral_engine);

        let transfer_engine = Arc::new(ConditionalTransferEngine::new(
            Arc::clone(&lock_service),
            Arc::clone(&collateral_engine),
            Arc::clone(&self.protocol),
            channel_repo,
            transfer_repo,
            app_repo,
            self.config.node_identifier.clone(),
            self.config.transfer.clone(),
        ));

        let event_dispatcher = Arc::new(ChannelEventDispatcher::new(Arc::clone(
            &transfer_engine,
        )));

        Ok(HubNode {
            config: self.config,
            lock_service,
            collateral_engine,
            transfer_engine,
            event_dispatcher,
        })
    }
}
