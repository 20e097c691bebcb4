//! Conditional transfer engine integration tests: the end-to-end resolve
//! path, collateral atomicity, unlock idempotence, status derivation, and
//! the check-in recovery sweep.

mod common;

use common::{
    build_harness, seed_channel, sender_proposal, test_config, TestHarness, HUB, NATIVE_ASSET,
};
use hub_node::channel::{
    AppRepository, ChannelRepository, RebalanceProfile, TransferRecordStatus, TransferRepository,
};
use hub_node::protocol::{AppInstance, AppType};
use hub_node::transfer::condition::hash_preimage;
use hub_node::transfer::{TransferClaim, TransferError, TransferStatus};
use hub_node::types::Bytes32;
use hub_node::Amount;
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::time::Duration;

const SENDER_CHAN: &str = "0xchan-alice";
const RECEIVER_CHAN: &str = "0xchan-bob";

fn secret() -> Bytes32 {
    Bytes32::from_bytes(&[0x5a; 32])
}

async fn harness_with_channels() -> TestHarness {
    let harness = build_harness(test_config());
    seed_channel(&harness, SENDER_CHAN, "alice").await;
    seed_channel(&harness, RECEIVER_CHAN, "bob").await;
    harness
}

/// Propose a 100 wei alice→bob transfer locked on `secret()`.
async fn propose(harness: &TestHarness, payment_id: &str) -> AppInstance {
    let lock_hash = hash_preimage(&secret()).unwrap();
    let app = sender_proposal(payment_id, "alice", "bob", SENDER_CHAN, 100, lock_hash);
    harness
        .node
        .transfer_engine()
        .handle_sender_proposal(&app)
        .await
        .unwrap();
    app
}

#[tokio::test]
async fn proposal_creates_a_pending_row() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;

    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferRecordStatus::Pending);
    assert_eq!(record.amount, Amount::from(100u64));
    assert_eq!(record.receiver_identifier, "bob");
    assert!(record.receiver_app_id.is_none());
}

#[tokio::test]
async fn proposal_not_toward_the_hub_is_rejected() {
    let harness = harness_with_channels().await;
    let lock_hash = hash_preimage(&secret()).unwrap();
    // funds flow alice→carol, the hub is not a party
    let mut app = sender_proposal("pay-1", "alice", "bob", SENDER_CHAN, 100, lock_hash);
    app.latest_state.coin_transfers[1].to = "carol".to_string();

    let result = harness
        .node
        .transfer_engine()
        .handle_sender_proposal(&app)
        .await;
    assert!(matches!(
        result,
        Err(TransferError::InconsistentTransferState { .. })
    ));
}

#[tokio::test]
async fn resolve_collateralizes_then_installs_the_receiver_app() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    // receiver channel is empty: 100 wei pending against [50, 200] bounds
    let resolution = engine
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await
        .unwrap();
    assert_eq!(resolution.amount, Amount::from(100u64));

    // topped up to the profile ceiling before promising the transfer
    let deposits = harness.protocol.deposits.lock().await.clone();
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0].0, RECEIVER_CHAN);
    assert_eq!(deposits[0].2, Amount::from(200u64));

    let installs = harness.protocol.installs.lock().await;
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].multisig_address, RECEIVER_CHAN);
    // hub funds the receiver side for the full transfer amount
    assert_eq!(installs[0].initial_state.coin_transfers[0].to, HUB);
    assert_eq!(
        installs[0].initial_state.coin_transfers[0].amount,
        Amount::from(100u64)
    );
    assert_eq!(installs[0].initial_state.coin_transfers[1].to, "bob");

    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferRecordStatus::Redeemed);
    assert_eq!(record.receiver_app_id, Some(resolution.receiver_app_id));
}

#[tokio::test]
async fn failed_collateralization_installs_nothing_and_stays_pending() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    harness.protocol.fail_deposits(true);
    let engine = harness.node.transfer_engine();

    let result = engine
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await;
    assert!(matches!(
        result,
        Err(TransferError::InsufficientCollateral { .. })
    ));
    assert!(harness.protocol.installs.lock().await.is_empty());

    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferRecordStatus::Pending);

    // retryable: the same claim goes through once liquidity is available
    harness.protocol.fail_deposits(false);
    engine
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await
        .unwrap();
}

#[tokio::test]
async fn wrong_preimage_is_an_invalid_claim() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;

    let wrong = Bytes32::from_bytes(&[0x99; 32]);
    let result = harness
        .node
        .transfer_engine()
        .resolve("pay-1", TransferClaim::Preimage(wrong), "bob")
        .await;
    assert!(matches!(result, Err(TransferError::InvalidClaim { .. })));
    assert_eq!(harness.protocol.deposit_count().await, 0);
}

#[tokio::test]
async fn unknown_payment_id_is_not_found() {
    let harness = harness_with_channels().await;
    let result = harness
        .node
        .transfer_engine()
        .resolve("pay-missing", TransferClaim::Preimage(secret()), "bob")
        .await;
    assert!(matches!(result, Err(TransferError::TransferNotFound(_))));
}

#[tokio::test]
async fn already_redeemed_transfer_cannot_be_claimed_again() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    engine
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await
        .unwrap();
    let result = engine
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await;
    assert!(matches!(result, Err(TransferError::TransferNotFound(_))));
    assert_eq!(harness.protocol.installs.lock().await.len(), 1);
}

#[tokio::test]
async fn rejection_marks_the_row_failed() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    engine.handle_rejected("pay-1").await.unwrap();
    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferRecordStatus::Failed);

    // repeat delivery of the event is harmless
    engine.handle_rejected("pay-1").await.unwrap();
    engine.handle_rejected("pay-unknown").await.unwrap();
}

/// Drive a transfer through resolve, then return the receiver app as the
/// protocol would report it after the receiver claimed and uninstalled.
async fn resolve_and_complete_receiver(harness: &TestHarness, payment_id: &str) -> AppInstance {
    let resolution = harness
        .node
        .transfer_engine()
        .resolve(payment_id, TransferClaim::Preimage(secret()), "bob")
        .await
        .unwrap();

    let mut receiver_app = harness
        .app_repo
        .get(&resolution.receiver_app_id)
        .await
        .unwrap()
        .unwrap();
    receiver_app.app_type = AppType::Uninstalled;
    receiver_app.latest_state.preimage = secret();
    harness.app_repo.upsert(receiver_app.clone()).await.unwrap();
    receiver_app
}

#[tokio::test]
async fn receiver_uninstall_unlocks_the_sender_side() {
    let harness = harness_with_channels().await;
    let sender_app = propose(&harness, "pay-1").await;
    let receiver_app = resolve_and_complete_receiver(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    engine
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();

    let actions = harness.protocol.actions.lock().await.clone();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].0, sender_app.identity_hash);
    assert_eq!(actions[0].1.preimage, secret());
    assert_eq!(
        harness.protocol.uninstalls.lock().await.as_slice(),
        &[sender_app.identity_hash.clone()]
    );

    let stored = harness
        .app_repo
        .get(&sender_app.identity_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.app_type, AppType::Uninstalled);
    assert_eq!(stored.latest_state.preimage, secret());
}

#[tokio::test]
async fn duplicate_uninstall_events_are_idempotent() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let receiver_app = resolve_and_complete_receiver(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    engine
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();
    engine
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();

    assert_eq!(harness.protocol.actions.lock().await.len(), 1);
    assert_eq!(harness.protocol.uninstalls.lock().await.len(), 1);
}

#[tokio::test]
async fn uninstall_without_a_revealed_secret_does_nothing() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let resolution = harness
        .node
        .transfer_engine()
        .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
        .await
        .unwrap();

    let mut receiver_app = harness
        .app_repo
        .get(&resolution.receiver_app_id)
        .await
        .unwrap()
        .unwrap();
    receiver_app.app_type = AppType::Uninstalled;
    // preimage still zero: the condition was never satisfied

    harness
        .node
        .transfer_engine()
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();
    assert!(harness.protocol.actions.lock().await.is_empty());
    assert!(harness.protocol.uninstalls.lock().await.is_empty());
}

#[tokio::test]
async fn status_follows_the_transfer_lifecycle() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    let engine = harness.node.transfer_engine();

    let view = engine.get_transfer("pay-1").await.unwrap();
    assert_eq!(view.status, TransferStatus::Pending);
    assert!(view.receiver_app_id.is_none());

    resolve_and_complete_receiver(&harness, "pay-1").await;
    let view = engine.get_transfer("pay-1").await.unwrap();
    assert_eq!(view.status, TransferStatus::Completed);
    assert!(view.receiver_app_id.is_some());
}

#[tokio::test]
async fn rejected_sender_app_reads_as_failed() {
    let harness = harness_with_channels().await;
    let sender_app = propose(&harness, "pay-1").await;
    harness
        .app_repo
        .set_type(&sender_app.identity_hash, AppType::Rejected)
        .await
        .unwrap();

    let view = harness
        .node
        .transfer_engine()
        .get_transfer("pay-1")
        .await
        .unwrap();
    assert_eq!(view.status, TransferStatus::Failed);
}

#[tokio::test]
async fn lapsed_timelock_reads_as_expired() {
    let harness = harness_with_channels().await;
    let lock_hash = hash_preimage(&secret()).unwrap();
    let mut app = sender_proposal("pay-1", "alice", "bob", SENDER_CHAN, 100, lock_hash);
    app.latest_state.expiry = Some(100);
    let engine = harness.node.transfer_engine();
    engine.handle_sender_proposal(&app).await.unwrap();

    harness.protocol.set_block_height(90);
    let view = engine.get_transfer("pay-1").await.unwrap();
    assert_eq!(view.status, TransferStatus::Pending);

    harness.protocol.set_block_height(150);
    let view = engine.get_transfer("pay-1").await.unwrap();
    assert_eq!(view.status, TransferStatus::Expired);
}

#[tokio::test]
async fn check_in_reports_unclaimed_transfers() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;
    propose(&harness, "pay-2").await;

    let report = harness.node.transfer_engine().check_in("bob").await.unwrap();
    let mut resolvable = report.resolvable.clone();
    resolvable.sort();
    assert_eq!(resolvable, vec!["pay-1".to_string(), "pay-2".to_string()]);
    assert!(report.unlocked.is_empty());
}

#[tokio::test]
async fn check_in_drives_missed_sender_unlocks() {
    let harness = harness_with_channels().await;
    let sender_app = propose(&harness, "pay-1").await;
    // the receiver completed while alice was offline; the uninstall event
    // toward the sender side was never processed
    resolve_and_complete_receiver(&harness, "pay-1").await;

    let report = harness
        .node
        .transfer_engine()
        .check_in("alice")
        .await
        .unwrap();
    assert_eq!(report.unlocked, vec!["pay-1".to_string()]);

    let stored = harness
        .app_repo
        .get(&sender_app.identity_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.app_type, AppType::Uninstalled);

    // a repeated sweep re-checks the row but drives no further protocol work
    harness
        .node
        .transfer_engine()
        .check_in("alice")
        .await
        .unwrap();
    assert_eq!(harness.protocol.actions.lock().await.len(), 1);
    assert_eq!(harness.protocol.uninstalls.lock().await.len(), 1);
}

#[tokio::test]
async fn proposal_without_a_recipient_is_rejected() {
    let harness = harness_with_channels().await;
    let lock_hash = hash_preimage(&secret()).unwrap();
    let mut app = sender_proposal("pay-1", "alice", "bob", SENDER_CHAN, 100, lock_hash);
    app.meta = serde_json::json!({});

    let result = harness
        .node
        .transfer_engine()
        .handle_sender_proposal(&app)
        .await;
    assert!(matches!(
        result,
        Err(TransferError::InconsistentTransferState { .. })
    ));
    assert!(harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .is_none());

    // an empty recipient string is just as unroutable
    app.meta = serde_json::json!({ "recipient": "" });
    let result = harness
        .node
        .transfer_engine()
        .handle_sender_proposal(&app)
        .await;
    assert!(matches!(
        result,
        Err(TransferError::InconsistentTransferState { .. })
    ));
}

#[tokio::test]
async fn proposal_persists_only_under_the_channel_lock() {
    let harness = harness_with_channels().await;
    let lock = harness.node.lock_service();
    let token = lock.acquire(SENDER_CHAN, None).await.unwrap();

    let engine = harness.node.transfer_engine();
    let lock_hash = hash_preimage(&secret()).unwrap();
    let app = sender_proposal("pay-1", "alice", "bob", SENDER_CHAN, 100, lock_hash);
    let task = tokio::spawn(async move { engine.handle_sender_proposal(&app).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .is_none());

    lock.release(SENDER_CHAN, &token).await.unwrap();
    task.await.unwrap().unwrap();
    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransferRecordStatus::Pending);
}

#[tokio::test]
async fn resolve_serializes_against_the_sender_channel() {
    let harness = harness_with_channels().await;
    propose(&harness, "pay-1").await;

    let lock = harness.node.lock_service();
    let token = lock.acquire(SENDER_CHAN, None).await.unwrap();

    let engine = harness.node.transfer_engine();
    let task = tokio::spawn(async move {
        engine
            .resolve("pay-1", TransferClaim::Preimage(secret()), "bob")
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert!(harness.protocol.installs.lock().await.is_empty());

    lock.release(SENDER_CHAN, &token).await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(harness.protocol.installs.lock().await.len(), 1);
}

#[tokio::test]
async fn signed_secret_resolve_replays_the_signature_on_unlock() {
    let harness = harness_with_channels().await;
    let engine = harness.node.transfer_engine();

    let secp = Secp256k1::new();
    let secret_key = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let signer = hex::encode(secret_key.public_key(&secp).serialize());

    let data = Bytes32::from_bytes(&[0x33; 32]);
    let digest: [u8; 32] = Sha256::digest(data.to_bytes().unwrap()).into();
    let signature = secp.sign_ecdsa_recoverable(&Message::from_digest(digest), &secret_key);
    let (recovery_id, compact) = signature.serialize_compact();
    let mut raw = compact.to_vec();
    raw.push(recovery_id.to_i32() as u8);
    let sig_hex = hex::encode(&raw);

    let mut app = sender_proposal("pay-1", "alice", "bob", SENDER_CHAN, 100, Bytes32::zero());
    app.latest_state.signer = Some(signer);
    engine.handle_sender_proposal(&app).await.unwrap();

    let resolution = engine
        .resolve(
            "pay-1",
            TransferClaim::SignedSecret {
                data: data.clone(),
                signature: sig_hex.clone(),
            },
            "bob",
        )
        .await
        .unwrap();

    // the claim's secret material survives on the row
    let record = harness
        .transfer_repo
        .get_by_payment_id("pay-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.unlock_signature.as_deref(), Some(sig_hex.as_str()));

    let mut receiver_app = harness
        .app_repo
        .get(&resolution.receiver_app_id)
        .await
        .unwrap()
        .unwrap();
    receiver_app.app_type = AppType::Uninstalled;
    receiver_app.latest_state.preimage = data.clone();
    harness.app_repo.upsert(receiver_app.clone()).await.unwrap();

    engine
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();

    // the sender unlock action carries both the secret and the signature
    let actions = harness.protocol.actions.lock().await.clone();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].1.preimage, data);
    assert_eq!(actions[0].1.signature.as_deref(), Some(sig_hex.as_str()));
}

#[tokio::test]
async fn successful_reclaim_marks_the_row_reclaimed() {
    let harness = harness_with_channels().await;
    harness
        .channel_repo
        .attach_rebalance_profile(
            SENDER_CHAN,
            RebalanceProfile::new(
                NATIVE_ASSET.into(),
                Amount::from(50u64),
                Amount::from(200u64),
                Amount::from(250u64),
                Amount::from(500u64),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    harness
        .protocol
        .set_balance(SENDER_CHAN, NATIVE_ASSET, HUB, Amount::from(600u64))
        .await;

    propose(&harness, "pay-1").await;
    let receiver_app = resolve_and_complete_receiver(&harness, "pay-1").await;
    harness
        .node
        .transfer_engine()
        .handle_receiver_uninstalled(&receiver_app)
        .await
        .unwrap();

    // reclaim runs on its own task; wait for it to land
    let mut status = TransferRecordStatus::Redeemed;
    for _ in 0..100 {
        status = harness
            .transfer_repo
            .get_by_payment_id("pay-1")
            .await
            .unwrap()
            .unwrap()
            .status;
        if status == TransferRecordStatus::Reclaimed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TransferRecordStatus::Reclaimed);

    // withdrawn back down to the reclaim floor
    let withdrawals = harness.protocol.withdrawals.lock().await.clone();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].0, SENDER_CHAN);
    assert_eq!(withdrawals[0].2, Amount::from(350u64));
}
