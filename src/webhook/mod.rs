//! Admission webhook readiness gate for the start path
//!
//! Freshly woken nodes may not yet run the pods behind the cluster's
//! admission webhooks, and with `failurePolicy: Fail` every matching API
//! request is rejected until they do. The start sequence therefore waits for
//! every registered webhook to probe Ready before checking dependent
//! services. A webhook that never becomes Ready is reported, not fatal.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{Readiness, WebhookEndpoint};
use crate::context::Context;
use crate::Result;

/// Probes admission webhooks until they are Ready or the wait times out
pub struct WebhookReadinessChecker {
    ctx: Context,
}

impl WebhookReadinessChecker {
    /// Create a checker
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Probe one endpoint; an error yields Unknown unless it is fatal
    async fn probe(&self, mut endpoint: WebhookEndpoint) -> Result<WebhookEndpoint> {
        let readiness = match self
            .ctx
            .call("probe_webhook", || self.ctx.access.probe_webhook(&endpoint))
            .await
        {
            Ok(readiness) => readiness,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(webhook = %endpoint.name, error = %e, "Webhook probe failed");
                Readiness::Unknown
            }
        };
        endpoint.readiness = readiness;
        Ok(endpoint)
    }

    /// Wait for every registered webhook to probe Ready.
    ///
    /// Returns every endpoint with its last readiness. Unknown gates like
    /// NotReady. In a dry run only one probe round is made.
    #[instrument(skip(self), fields(cluster = %self.ctx.cluster.name))]
    pub async fn wait_ready(&self) -> Result<Vec<WebhookEndpoint>> {
        let mut pending = self
            .ctx
            .call("list_admission_webhooks", || {
                self.ctx.access.list_admission_webhooks()
            })
            .await?;
        if pending.is_empty() {
            info!("No admission webhooks registered");
            return Ok(Vec::new());
        }

        let cfg = &self.ctx.config.webhooks;
        let deadline = Instant::now() + cfg.timeout();
        let mut backoff = cfg.backoff();
        let mut ready = Vec::new();

        loop {
            let probed: Vec<Result<WebhookEndpoint>> = stream::iter(pending)
                .map(|endpoint| self.probe(endpoint))
                .buffer_unordered(self.ctx.config.calls.concurrency)
                .collect()
                .await;

            pending = Vec::new();
            for endpoint in probed {
                let endpoint = endpoint?;
                if endpoint.readiness == Readiness::Ready {
                    ready.push(endpoint);
                } else {
                    pending.push(endpoint);
                }
            }

            if pending.is_empty() {
                info!(webhooks = ready.len(), "All admission webhooks ready");
                break;
            }

            let now = Instant::now();
            if self.ctx.dry_run || now >= deadline {
                for endpoint in &pending {
                    warn!(
                        configuration = %endpoint.configuration,
                        webhook = %endpoint.name,
                        readiness = ?endpoint.readiness,
                        "Admission webhook not ready"
                    );
                }
                break;
            }

            let delay = backoff
                .next()
                .unwrap_or(Duration::from_millis(cfg.retry_max_ms))
                .min(deadline - now);
            debug!(
                pending = pending.len(),
                delay_ms = delay.as_millis(),
                "Waiting for admission webhooks"
            );
            tokio::time::sleep(delay).await;
        }

        let mut endpoints = ready;
        endpoints.append(&mut pending);
        endpoints.sort_by(|a, b| (&a.configuration, &a.name).cmp(&(&b.configuration, &b.name)));
        Ok(endpoints)
    }
}
