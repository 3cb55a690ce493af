//! Delivery mechanism trait.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::notification::Notification;
use crate::task::DeliveryMode;

/// Sends a rendered notification to a destination.
///
/// `destination` is the task target for [`DeliveryMode::Direct`] and the
/// task origin for [`DeliveryMode::Broadcast`]. Implementations report
/// [`DeliveryError::Unreachable`] when the destination itself cannot receive
/// messages, so the caller can fall back to the broadcast destination.
#[async_trait]
pub trait Deliverer: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        destination: &str,
        mode: DeliveryMode,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError>;
}
