use tokio::sync::mpsc;
use tracing::info;

use crate::discovery::UpdateReason;
use crate::{Error, Result};

/// Request the first discovery pass
pub async fn trigger_initial_discovery(sender: &mpsc::Sender<UpdateReason>) -> Result<()> {
    info!("Requesting initial discovery");
    sender
        .send(UpdateReason::InitialDiscovery)
        .await
        .map_err(|_| Error::internal("snapshot manager stopped before the initial discovery"))
}
