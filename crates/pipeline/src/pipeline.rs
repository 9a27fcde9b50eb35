//! Request Pipeline (§4.E): the one skeleton shared by all three inbound dialects — readiness
//! gate, usage counting, dispatch/attempt loop, and finalization. Dialect translation and
//! streaming-mode shaping live in [`crate::dialect`] and [`crate::streaming`]; this module is
//! the orchestration that ties them to the Registry and Switcher.

use std::{sync::Arc, time::Duration};

use relaygate_protocol::{AgentFrame, ProxyRequest, ServerFrame};
use relaygate_registry::{CloseReason, Queue, QueueError, Registry};
use relaygate_switcher::{ActivationBackend, FailureOutcome, SocketProbe, Switcher};
use tracing::{info, warn};

use crate::{config::PipelineConfig, error::PipelineError};

const RECOVERY_GRACE_WAIT: Duration = Duration::from_secs(60);
const BUSY_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
const SOCKET_AFTER_SWITCH_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The successful end of the attempt loop (§4.E.2): the frame that decided the attempt (a
/// `response_headers` frame, ordinarily), the queue the rest of the response streams from,
/// and which identity produced it (retries may have crossed identity boundaries).
pub struct AttemptOutcome {
    pub first_frame: AgentFrame,
    pub queue: Arc<Queue<AgentFrame>>,
    pub auth_index: u32,
}

pub struct Pipeline {
    registry: Arc<Registry>,
    switcher: Arc<Switcher>,
    backend: Arc<dyn ActivationBackend>,
    sockets: Arc<dyn SocketProbe>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        registry: Arc<Registry>,
        switcher: Arc<Switcher>,
        backend: Arc<dyn ActivationBackend>,
        sockets: Arc<dyn SocketProbe>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            switcher,
            backend,
            sockets,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// §4.E.1: bring `currentAuthIndex` (or a freshly-chosen one) to a state with a live
    /// socket, returning that identity's index.
    pub async fn recover(&self) -> Result<u32, PipelineError> {
        let reconnect_in_flight = self.registry.grace_window_active().await || self.switcher.is_busy();
        if reconnect_in_flight
            && let Some(auth_index) = self.switcher.current_auth_index().await
            && self.wait_for_socket(auth_index, RECOVERY_GRACE_WAIT).await
        {
            return Ok(auth_index);
        }

        let Some(identity) = self.switcher.current_identity().await else {
            return self
                .switcher
                .switch_to_next()
                .await
                .map_err(PipelineError::from);
        };

        if self.switcher.begin_direct_recovery() {
            let outcome = self.direct_recover(&identity).await;
            self.switcher.end_direct_recovery();
            if let Ok(auth_index) = outcome {
                return Ok(auth_index);
            }
            warn!(auth_index = identity.auth_index, "direct recovery failed, falling through to rotation");
        }

        if self.switcher.rotation_len().await == 0 {
            return Err(PipelineError::NoAccounts);
        }
        self.switcher.switch_to_next().await.map_err(PipelineError::from)
    }

    async fn direct_recover(&self, identity: &relaygate_browser::Identity) -> Result<u32, PipelineError> {
        self.backend.launch_or_switch_context(identity).await?;
        if self.wait_for_socket(identity.auth_index, SOCKET_AFTER_SWITCH_TIMEOUT).await {
            Ok(identity.auth_index)
        } else {
            Err(PipelineError::ReadinessTimeout)
        }
    }

    /// §4.E step 1: the full readiness gate, combining recovery with the busy/socket waits.
    pub async fn ensure_ready(&self) -> Result<u32, PipelineError> {
        let needs_recovery = match self.switcher.current_auth_index().await {
            Some(auth_index) => !self.sockets.has_socket(auth_index),
            None => true,
        };
        if needs_recovery {
            self.recover().await?;
        }

        if !self.wait_for_busy_clear(BUSY_WAIT_TIMEOUT).await {
            return Err(PipelineError::ReadinessTimeout);
        }

        let auth_index = self
            .switcher
            .current_auth_index()
            .await
            .ok_or(PipelineError::NoAccounts)?;
        if self.wait_for_socket(auth_index, SOCKET_AFTER_SWITCH_TIMEOUT).await {
            Ok(auth_index)
        } else {
            Err(PipelineError::ReadinessTimeout)
        }
    }

    /// §4.E.2: send `proxy_request`, retrying across identities as needed. Returns the first
    /// frame that decides the attempt. `record_success`/`record_failure` bookkeeping against
    /// the Switcher happens here since only the attempt loop knows which outcome occurred.
    pub async fn run_attempt_loop(
        &self,
        request_id: &str,
        mut build_request: impl FnMut(u32) -> ProxyRequest,
    ) -> Result<AttemptOutcome, PipelineError> {
        let mut auth_index = self.ensure_ready().await?;
        let mut queue = self.registry.create_queue(request_id.to_string(), auth_index).await;
        let max_retries = self.config.max_retries.max(1);
        let mut last_status = 503u16;
        let mut last_message = String::from("no accounts available");

        for attempt in 1..=max_retries {
            let Some(socket) = self.registry.get_socket_by_identity(auth_index) else {
                last_status = 503;
                last_message = "no socket for current identity".into();
                self.prepare_retry(request_id, auth_index, &mut queue, &mut auth_index)
                    .await;
                continue;
            };
            socket.send(ServerFrame::ProxyRequest(build_request(auth_index)));

            match queue
                .dequeue(Duration::from_millis(relaygate_protocol::QUEUE_DEFAULT_TIMEOUT_MS))
                .await
            {
                Ok(AgentFrame::Error { status, message, .. }) => {
                    last_status = status;
                    last_message = message.clone();
                    if self.config.immediate_switch_status_codes.contains(&status) {
                        self.registry.remove_queue(request_id, CloseReason::RequestComplete).await;
                        self.spawn_rotation_if_needed(FailureOutcome::RotateImmediately);
                        return Err(PipelineError::ImmediateSwitch { status, message });
                    }
                    warn!(request_id, status, attempt, "upstream error, retrying");
                }
                Err(QueueError::Timeout) => {
                    last_status = 504;
                    last_message = "queue idle timeout".into();
                    info!(request_id, attempt, "proxy_request timed out, retrying");
                }
                Err(QueueError::Closed(reason)) => {
                    info!(request_id, %reason, "queue closed mid-attempt, aborting retries");
                    return Err(PipelineError::QueueClosed(reason));
                }
                Ok(first_frame) => {
                    self.switcher.record_success();
                    return Ok(AttemptOutcome {
                        first_frame,
                        queue,
                        auth_index,
                    });
                }
            }

            if attempt < max_retries {
                self.prepare_retry(request_id, auth_index, &mut queue, &mut auth_index)
                    .await;
            }
        }

        let outcome = self.switcher.record_failure(last_status);
        self.spawn_rotation_if_needed(outcome);
        Err(PipelineError::Upstream {
            status: last_status,
            message: last_message,
        })
    }

    /// Between attempts (§4.E.2): cancel on the *original* identity, close the old queue with
    /// `retry_creating_new_queue`, sleep, then rebind a fresh queue to whatever identity is
    /// now current (rotation may have run concurrently via a background switch).
    async fn prepare_retry(
        &self,
        request_id: &str,
        previous_auth_index: u32,
        queue: &mut Arc<Queue<AgentFrame>>,
        auth_index: &mut u32,
    ) {
        if let Some(socket) = self.registry.get_socket_by_identity(previous_auth_index) {
            socket.send(ServerFrame::CancelRequest {
                request_id: request_id.to_string(),
            });
        }
        self.registry
            .remove_queue(request_id, CloseReason::RetryCreatingNewQueue)
            .await;
        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;

        *auth_index = self
            .switcher
            .current_auth_index()
            .await
            .unwrap_or(previous_auth_index);
        *queue = self
            .registry
            .create_queue(request_id.to_string(), *auth_index)
            .await;
    }

    fn spawn_rotation_if_needed(&self, outcome: FailureOutcome) {
        if outcome == FailureOutcome::NoRotation {
            return;
        }
        let switcher = self.switcher.clone();
        tokio::spawn(async move {
            if let Err(err) = switcher.switch_to_next().await {
                warn!(error = %err, "background rotation after exhausted retries failed");
            }
        });
    }

    /// §4.E step 8 finalization: remove the queue, and if usage-based rotation was flagged
    /// during this request, spawn it in the background rather than delaying the response.
    pub async fn finalize(&self, request_id: &str, needs_switch_after_request: bool) {
        self.registry
            .remove_queue(request_id, CloseReason::RequestComplete)
            .await;
        if needs_switch_after_request {
            let switcher = self.switcher.clone();
            tokio::spawn(async move {
                if let Err(err) = switcher.switch_to_next().await {
                    warn!(error = %err, "usage-based rotation failed");
                }
            });
        }
    }

    /// Client-disconnect handling (§4.E.3): cancel on whichever identity *currently* owns the
    /// request-id (not the switcher's current identity — retries may have crossed boundaries),
    /// then close the queue with `client_disconnect`. Never counts as a failure.
    pub async fn handle_client_disconnect(&self, request_id: &str) {
        if let Some(identity) = self.registry.get_identity_by_request(request_id)
            && let Some(socket) = self.registry.get_socket_by_identity(identity)
        {
            socket.send(ServerFrame::CancelRequest {
                request_id: request_id.to_string(),
            });
        }
        self.registry
            .remove_queue(request_id, CloseReason::ClientDisconnect)
            .await;
    }

    /// Pairs with [`Pipeline::handle_client_disconnect`] for a real-stream response cut short
    /// by the client going away mid-stream: the queue is torn down the same way, but a
    /// usage-triggered rotation flagged earlier in the request still needs to run, exactly as
    /// it would have via [`Pipeline::finalize`] had the response completed normally.
    pub async fn finalize_disconnected(&self, request_id: &str, needs_switch_after_request: bool) {
        self.handle_client_disconnect(request_id).await;
        if needs_switch_after_request {
            let switcher = self.switcher.clone();
            tokio::spawn(async move {
                if let Err(err) = switcher.switch_to_next().await {
                    warn!(error = %err, "usage-based rotation failed after client disconnect");
                }
            });
        }
    }

    async fn wait_for_socket(&self, auth_index: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sockets.has_socket(auth_index) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_busy_clear(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.switcher.is_busy() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }
}
