//! Shared test harness: a scriptable protocol client and node wiring helpers

use async_trait::async_trait;
use hub_node::channel::{
    Channel, ChannelRepository, MemoryAppRepository, MemoryChannelRepository,
    MemoryTransferRepository,
};
use hub_node::config::HubConfig;
use hub_node::protocol::{
    AppInstance, AppType, CoinTransfer, InstallRequest, ProtocolClient, TransferState,
    UnlockAction,
};
use hub_node::types::{Amount, AppIdentityHash, Bytes32};
use hub_node::HubNode;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const HUB: &str = "hub";
pub const NATIVE_ASSET: &str = "0x0";

/// Route engine logs through the test writer. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Scriptable in-memory protocol client. Records every call and lets tests
/// inject deposit failures and latency.
#[derive(Default)]
pub struct MockProtocolClient {
    balances: Mutex<HashMap<(String, String, String), Amount>>,
    pub installs: Mutex<Vec<InstallRequest>>,
    pub actions: Mutex<Vec<(AppIdentityHash, UnlockAction)>>,
    pub uninstalls: Mutex<Vec<AppIdentityHash>>,
    pub deposits: Mutex<Vec<(String, String, Amount)>>,
    pub withdrawals: Mutex<Vec<(String, String, Amount)>>,
    fail_deposits: AtomicBool,
    deposit_delay_ms: AtomicU64,
    block_height: AtomicU64,
    next_app_id: AtomicU64,
}

impl MockProtocolClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_balance(&self, multisig: &str, asset: &str, party: &str, amount: Amount) {
        self.balances.lock().await.insert(
            (multisig.to_string(), asset.to_string(), party.to_string()),
            amount,
        );
    }

    pub async fn balance(&self, multisig: &str, asset: &str, party: &str) -> Amount {
        self.balances
            .lock()
            .await
            .get(&(multisig.to_string(), asset.to_string(), party.to_string()))
            .copied()
            .unwrap_or_else(Amount::zero)
    }

    pub fn fail_deposits(&self, fail: bool) {
        self.fail_deposits.store(fail, Ordering::SeqCst);
    }

    pub fn set_deposit_delay(&self, delay: Duration) {
        self.deposit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    pub async fn deposit_count(&self) -> usize {
        self.deposits.lock().await.len()
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    async fn install(&self, request: InstallRequest) -> anyhow::Result<AppIdentityHash> {
        let id = format!(
            "receiver-app-{}",
            self.next_app_id.fetch_add(1, Ordering::SeqCst)
        );
        self.installs.lock().await.push(request);
        Ok(id)
    }

    async fn take_action(&self, identity_hash: &str, action: UnlockAction) -> anyhow::Result<()> {
        self.actions
            .lock()
            .await
            .push((identity_hash.to_string(), action));
        Ok(())
    }

    async fn uninstall(&self, identity_hash: &str) -> anyhow::Result<()> {
        self.uninstalls.lock().await.push(identity_hash.to_string());
        Ok(())
    }

    async fn deposit(
        &self,
        multisig_address: &str,
        asset_id: &str,
        amount: Amount,
    ) -> anyhow::Result<()> {
        let delay = self.deposit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_deposits.load(Ordering::SeqCst) {
            anyhow::bail!("simulated on-chain deposit failure");
        }
        let key = (
            multisig_address.to_string(),
            asset_id.to_string(),
            HUB.to_string(),
        );
        let mut balances = self.balances.lock().await;
        let current = balances.get(&key).copied().unwrap_or_else(Amount::zero);
        balances.insert(key, current + amount);
        drop(balances);
        self.deposits.lock().await.push((
            multisig_address.to_string(),
            asset_id.to_string(),
            amount,
        ));
        Ok(())
    }

    async fn withdraw(
        &self,
        multisig_address: &str,
        asset_id: &str,
        amount: Amount,
    ) -> anyhow::Result<()> {
        let key = (
            multisig_address.to_string(),
            asset_id.to_string(),
            HUB.to_string(),
        );
        let mut balances = self.balances.lock().await;
        let current = balances.get(&key).copied().unwrap_or_else(Amount::zero);
        balances.insert(key, current.saturating_sub(amount));
        drop(balances);
        self.withdrawals.lock().await.push((
            multisig_address.to_string(),
            asset_id.to_string(),
            amount,
        ));
        Ok(())
    }

    async fn free_balance(
        &self,
        multisig_address: &str,
        asset_id: &str,
        party: &str,
    ) -> anyhow::Result<Amount> {
        Ok(self.balance(multisig_address, asset_id, party).await)
    }

    async fn current_block_height(&self, _chain_id: u64) -> anyhow::Result<u64> {
        Ok(self.block_height.load(Ordering::SeqCst))
    }
}

/// Assembled node plus handles to everything a test needs to seed or assert
/// on.
pub struct TestHarness {
    pub node: HubNode,
    pub protocol: Arc<MockProtocolClient>,
    pub channel_repo: Arc<MemoryChannelRepository>,
    pub transfer_repo: Arc<MemoryTransferRepository>,
    pub app_repo: Arc<MemoryAppRepository>,
}

/// Test config: hub identity plus a small default rebalance profile
/// (collateralize between 50 and 200 wei, reclaim disabled).
pub fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.node_identifier = HUB.to_string();
    config.collateral.default_profile.lower_bound_collateralize = "50".to_string();
    config.collateral.default_profile.upper_bound_collateralize = "200".to_string();
    config.collateral.default_profile.lower_bound_reclaim = "0".to_string();
    config.collateral.default_profile.upper_bound_reclaim = "0".to_string();
    config.retry.base_backoff_ms = 1;
    config.retry.max_jitter_ms = 0;
    config
}

pub fn build_harness(config: HubConfig) -> TestHarness {
    init_tracing();
    let protocol = Arc::new(MockProtocolClient::new());
    let channel_repo = Arc::new(MemoryChannelRepository::new());
    let transfer_repo = Arc::new(MemoryTransferRepository::new());
    let app_repo = Arc::new(MemoryAppRepository::new());

    let node = HubNode::builder(config, protocol.clone())
        .with_channel_repository(channel_repo.clone())
        .with_transfer_repository(transfer_repo.clone())
        .with_app_repository(app_repo.clone())
        .build()
        .expect("node wiring");

    TestHarness {
        node,
        protocol,
        channel_repo,
        transfer_repo,
        app_repo,
    }
}

pub async fn seed_channel(harness: &TestHarness, multisig: &str, user: &str) -> Channel {
    let channel = Channel::new(multisig.to_string(), user.to_string(), HUB.to_string(), 1);
    harness
        .channel_repo
        .save(channel.clone())
        .await
        .expect("seed channel");
    channel
}

/// A sender-side transfer app as the protocol event listener would deliver
/// it: `sender` funds `amount` toward the hub, routed to `recipient`.
pub fn sender_proposal(
    payment_id: &str,
    sender: &str,
    recipient: &str,
    multisig: &str,
    amount: u64,
    lock_hash: Bytes32,
) -> AppInstance {
    AppInstance {
        identity_hash: format!("sender-app-{payment_id}"),
        app_type: AppType::Instance,
        latest_state: TransferState {
            payment_id: payment_id.to_string(),
            coin_transfers: [
                CoinTransfer {
                    to: sender.to_string(),
                    amount: Amount::from(amount),
                },
                CoinTransfer {
                    to: HUB.to_string(),
                    amount: Amount::zero(),
                },
            ],
            lock_hash,
            preimage: Bytes32::zero(),
            expiry: None,
            signer: None,
        },
        meta: json!({ "recipient": recipient }),
        initiator_deposit_asset_id: NATIVE_ASSET.to_string(),
        multisig_address: multisig.to_string(),
    }
}
