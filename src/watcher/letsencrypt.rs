//! Certificate issuing and renewal timers

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument, Span};

use super::notify;
use crate::acme::CertificateLifecycle;
use crate::config::AcmeConfig;
use crate::discovery::UpdateReason;

pub struct CertificateWatcher {
    lifecycle: Arc<CertificateLifecycle>,
    issue_interval: Duration,
    renewal_interval: Duration,
    span: Span,
}

impl CertificateWatcher {
    pub fn new(
        lifecycle: Arc<CertificateLifecycle>,
        issue_interval: Duration,
        renewal_interval: Duration,
        span: Span,
    ) -> Self {
        Self { lifecycle, issue_interval, renewal_interval, span }
    }

    pub fn from_config(lifecycle: Arc<CertificateLifecycle>, config: &AcmeConfig, span: Span) -> Self {
        Self::new(lifecycle, config.issue_interval(), config.renewal_interval(), span)
    }

    /// Tick until shutdown. Both timers first fire one period after start.
    pub async fn run(self, sender: mpsc::Sender<UpdateReason>, shutdown: CancellationToken) {
        let span = self.span.clone();
        self.tick(sender, shutdown).instrument(span).await
    }

    async fn tick(&self, sender: mpsc::Sender<UpdateReason>, shutdown: CancellationToken) {
        let start = Instant::now();
        let mut issue = interval_at(start + self.issue_interval, self.issue_interval);
        let mut renewal = interval_at(start + self.renewal_interval, self.renewal_interval);
        issue.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reason = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = issue.tick() => match self.lifecycle.issue_certificates().await {
                    Ok(true) => Some(UpdateReason::CertificateIssued),
                    Ok(false) => None,
                    Err(e) => {
                        error!(error = %e, "Certificate issuing failed");
                        None
                    }
                },
                _ = renewal.tick() => {
                    self.lifecycle.schedule_renewals().await.then_some(UpdateReason::RenewalScheduled)
                }
            };

            if let Some(reason) = reason {
                if !notify(&sender, reason, &shutdown).await {
                    break;
                }
            }
        }

        debug!("Certificate watcher stopped");
    }
}
