//! # Event producers
//!
//! Everything that may change the proxy configuration sends an
//! [`UpdateReason`] into the discovery channel:
//! - [`SwarmWatcher`] follows the registry's service events
//! - [`CertificateWatcher`] drives certificate issuing and renewal timers
//! - [`trigger_initial_discovery`] requests the first pass at boot
//!
//! The channel is bounded, so a producer waits while a pass is running.
//! Producers return once the shutdown token is cancelled or the manager is gone.

pub mod letsencrypt;
pub mod startup;
pub mod swarm;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use letsencrypt::CertificateWatcher;
pub use startup::trigger_initial_discovery;
pub use swarm::SwarmWatcher;

use crate::discovery::UpdateReason;

/// Capacity of the discovery channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Create the discovery channel shared by every producer
pub fn event_channel() -> (mpsc::Sender<UpdateReason>, mpsc::Receiver<UpdateReason>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Send `reason` unless shutdown wins the race. Returns false when the
/// producer should stop.
pub(crate) async fn notify(
    sender: &mpsc::Sender<UpdateReason>,
    reason: UpdateReason,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = sender.send(reason) => sent.is_ok(),
    }
}
