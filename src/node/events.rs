//! Channel event dispatch
//!
//! The protocol event listener (an external collaborator on the messaging
//! transport) delivers install/uninstall/propose events here; this module
//! routes them into the transfer engine. One event's failure is logged and
//! isolated so it never poisons the next.

use crate::protocol::AppInstance;
use crate::transfer::ConditionalTransferEngine;
use crate::types::{PaymentId, UserIdentifier};
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol events the coordination core reacts to.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A paying user proposed a sender-side transfer app toward the hub.
    AppProposed { app: AppInstance },
    /// A transfer app finished uninstalling.
    AppUninstalled { app: AppInstance },
    /// A proposal was rejected by either party.
    AppRejected { payment_id: PaymentId },
    /// A client reconnected and signalled a check-in.
    ClientCheckIn { user: UserIdentifier },
}

/// Routes channel events into the engines.
pub struct ChannelEventDispatcher {
    transfer_engine: Arc<ConditionalTransferEngine>,
}

impl ChannelEventDispatcher {
    pub fn new(transfer_engine: Arc<ConditionalTransferEngine>) -> Self {
        Self { transfer_engine }
    }

    /// Handle one event. Never returns an error; failures are logged so the
    /// listener's delivery loop keeps going.
    pub async fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::AppProposed { app } => {
                debug!("Event: app proposed ({})", app.identity_hash);
                if let Err(e) = self.transfer_engine.handle_sender_proposal(&app).await {
                    warn!(
                        "Sender proposal {} not accepted: {}",
                        app.identity_hash, e
                    );
                }
            }
            ChannelEvent::AppUninstalled { app } => {
                debug!("Event: app uninstalled ({})", app.identity_hash);
                if let Err(e) = self.transfer_engine.handle_receiver_uninstalled(&app).await {
                    warn!(
                        "Unlock after uninstall of {} failed: {}",
                        app.identity_hash, e
                    );
                }
            }
            ChannelEvent::AppRejected { payment_id } => {
                debug!("Event: app rejected (payment {})", payment_id);
                if let Err(e) = self.transfer_engine.handle_rejected(&payment_id).await {
                    warn!("Rejection handling for {} failed: {}", payment_id, e);
                }
            }
            ChannelEvent::ClientCheckIn { user } => {
                debug!("Event: client check-in ({})", user);
                if let Err(e) = self.transfer_engine.check_in(&user).await {
                    warn!("Check-in sweep for {} failed: {}", user, e);
                }
            }
        }
    }
}
