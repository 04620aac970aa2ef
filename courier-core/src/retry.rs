//! The retry layer: observes completed responses and decides whether to
//! re-attempt.
//!
//! Retry attempts skip the queue and go to node selection directly, so a
//! retried request moves to a different host immediately instead of
//! waiting behind fresh traffic; only when every host is saturated does
//! the attempt fall back into the queued path.

use std::{sync::Arc, time::Duration};

use http::{header, Method, StatusCode};
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::{
    channel::{Channel, ResponseFuture},
    config::{ClientConfig, RetryOnTimeout, ServerQos},
    error::ClientError,
    metrics::ClientMetrics,
    selection::NodeSelectionChannel,
    types::{Endpoint, Request, Response},
};

/// Redirect hops are free of retry budget, so bound them separately to
/// keep termination guaranteed even for a misconfigured upstream that
/// bounces requests in a cycle.
const MAX_REDIRECTS: u32 = 20;

pub(crate) struct RetryingChannel {
    state: Arc<RetryState>,
}

struct RetryState {
    delegate: Arc<dyn Channel>,
    selection: Arc<NodeSelectionChannel>,
    host_base_urls: Vec<String>,
    max_num_retries: u32,
    backoff_slot_size: Duration,
    server_qos: ServerQos,
    retry_on_timeout: RetryOnTimeout,
    metrics: ClientMetrics,
}

impl RetryingChannel {
    pub(crate) fn new(
        delegate: Arc<dyn Channel>,
        selection: Arc<NodeSelectionChannel>,
        host_base_urls: Vec<String>,
        config: &ClientConfig,
        metrics: ClientMetrics,
    ) -> Self {
        Self {
            state: Arc::new(RetryState {
                delegate,
                selection,
                host_base_urls,
                max_num_retries: config.max_num_retries,
                backoff_slot_size: config.backoff_slot_size,
                server_qos: config.server_qos,
                retry_on_timeout: config.retry_on_timeout,
                metrics,
            }),
        }
    }
}

impl Channel for RetryingChannel {
    fn execute(&self, endpoint: &Endpoint, request: &Request) -> ResponseFuture {
        let state = Arc::clone(&self.state);
        let endpoint = endpoint.clone();
        let request = request.clone();
        Box::pin(async move { state.execute_with_retries(endpoint, request).await })
    }
}

impl RetryState {
    async fn execute_with_retries(
        self: Arc<Self>,
        endpoint: Endpoint,
        mut request: Request,
    ) -> Result<Response, ClientError> {
        let mut failures = 0u32;
        let mut redirects = 0u32;
        let mut is_retry = false;

        loop {
            let result = self.attempt(&endpoint, &request, is_retry).await;
            is_retry = true;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status == StatusCode::PERMANENT_REDIRECT {
                        match self.redirect_target(&response) {
                            Some(host) if redirects < MAX_REDIRECTS => {
                                redirects += 1;
                                self.metrics.retry("STATUS_308").mark();
                                debug!(host, "redirected to another host");
                                response.close();
                                request = request.with_host_override(host);
                                continue;
                            }
                            // An unrecognized or excessive redirect is the
                            // caller's problem.
                            _ => return Ok(response),
                        }
                    }

                    if matches!(status.as_u16(), 429 | 503) {
                        if self.server_qos == ServerQos::AutomaticRetry
                            && failures < self.max_num_retries
                        {
                            let reason = if status == StatusCode::TOO_MANY_REQUESTS {
                                "STATUS_429"
                            } else {
                                "STATUS_503"
                            };
                            self.metrics.retry(reason).mark();
                            let backoff = retry_after(&response)
                                .unwrap_or_else(|| self.exponential_backoff(failures));
                            debug!(status = status.as_u16(), backoff = ?backoff, "retrying after QoS response");
                            response.close();
                            failures += 1;
                            sleep(backoff).await;
                            continue;
                        }
                        return Ok(response);
                    }

                    if status.is_server_error()
                        && is_idempotent(endpoint.method())
                        && failures < self.max_num_retries
                    {
                        let backoff = self.exponential_backoff(failures);
                        debug!(status = status.as_u16(), backoff = ?backoff, "retrying idempotent request after server error");
                        response.close();
                        failures += 1;
                        sleep(backoff).await;
                        continue;
                    }

                    return Ok(response);
                }
                Err(error) => {
                    let reason = match &error {
                        ClientError::Io(_) => Some("IO_EXCEPTION"),
                        ClientError::Timeout
                            if self.retry_on_timeout
                                == RetryOnTimeout::DangerousEnableAtRiskOfRetryStorms =>
                        {
                            Some("TIMEOUT")
                        }
                        _ => None,
                    };
                    match reason {
                        Some(reason) if failures < self.max_num_retries => {
                            self.metrics.retry(reason).mark();
                            let backoff = self.exponential_backoff(failures);
                            info!(error = %error, backoff = ?backoff, "retrying after transport failure");
                            failures += 1;
                            sleep(backoff).await;
                            continue;
                        }
                        _ => return Err(error),
                    }
                }
            }
        }
    }

    /// First attempts go through the delegate (the queued pipeline).
    /// Retries try node selection directly and only re-enter the queue
    /// when every host declines.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &Request,
        is_retry: bool,
    ) -> Result<Response, ClientError> {
        if is_retry {
            if let Some((_, future)) = self.selection.maybe_execute_tracked(endpoint, request) {
                return future.await;
            }
        }
        self.delegate.execute(endpoint, request).await
    }

    /// `random(0, 2^failures * slot)`.
    fn exponential_backoff(&self, failures: u32) -> Duration {
        let slot = self.backoff_slot_size.as_nanos() as u64;
        let upper = slot.saturating_mul(1u64 << failures.min(20));
        if upper == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..upper))
    }

    /// Maps a 308 `Location` to a configured host index.
    fn redirect_target(&self, response: &Response) -> Option<usize> {
        let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
        self.host_base_urls.iter().position(|base| location.starts_with(base.as_str()))
    }
}

/// Delta-seconds form only; an HTTP-date value falls back to the
/// exponential schedule.
fn retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    )
}
