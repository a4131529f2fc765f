//! Registry event subscription

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::notify;
use crate::discovery::UpdateReason;
use crate::registry::{ServiceEvent, ServiceRegistry};
use crate::utils::Backoff;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Service creation is followed by an update, which is what we react to
const IGNORED_ACTION: &str = "create";

/// Turns service events into discovery passes, resubscribing on failure
pub struct SwarmWatcher {
    registry: Arc<dyn ServiceRegistry>,
    max_backoff: Duration,
    span: Span,
}

impl SwarmWatcher {
    pub fn new(registry: Arc<dyn ServiceRegistry>, max_backoff: Duration, span: Span) -> Self {
        Self { registry, max_backoff, span }
    }

    pub async fn run(self, sender: mpsc::Sender<UpdateReason>, shutdown: CancellationToken) {
        let span = self.span.clone();
        self.watch(sender, shutdown).instrument(span).await
    }

    async fn watch(&self, sender: mpsc::Sender<UpdateReason>, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, self.max_backoff);

        loop {
            let subscription = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscription = self.registry.events() => subscription,
            };

            match subscription {
                Ok(mut events) => {
                    info!("Watching swarm service events");
                    loop {
                        let item = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            item = events.next() => item,
                        };

                        match item {
                            Some(Ok(event)) => {
                                backoff.reset();
                                if !self.forward(&event, &sender, &shutdown).await {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Service event stream failed");
                                break;
                            }
                            None => {
                                warn!("Service event stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to subscribe to service events"),
            }

            let delay = backoff.next_delay();
            info!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Resubscribing to service events");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Swarm watcher stopped");
    }

    async fn forward(
        &self,
        event: &ServiceEvent,
        sender: &mpsc::Sender<UpdateReason>,
        shutdown: &CancellationToken,
    ) -> bool {
        if event.action == IGNORED_ACTION {
            debug!(service_id = %event.service_id, "Ignoring service creation");
            return true;
        }

        debug!(
            action = %event.action,
            service_id = %event.service_id,
            service = event.service_name.as_deref().unwrap_or_default(),
            "Service changed"
        );
        notify(sender, UpdateReason::ServiceChanged, shutdown).await
    }
}
