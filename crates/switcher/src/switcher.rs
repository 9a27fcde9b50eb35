//! Account Switcher (§4.D): usage/failure-based rotation and the `isSystemBusy` interlock.
//!
//! The interlock is the single most failure-prone piece of this subsystem (§9 design note):
//! [`Switcher::switch_to_next`] and [`Switcher::switch_to_specific`] are the *only* methods
//! allowed to set [`Switcher::is_busy`] — the pipeline's direct-recovery path (§4.E.1) sets
//! and clears the same flag itself via [`Switcher::begin_direct_recovery`] /
//! [`Switcher::end_direct_recovery`] rather than calling into either of them, so the two
//! disciplines are structurally distinguishable in code, never just in a comment.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
};

use relaygate_browser::Identity;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    backend::{ActivationBackend, SocketProbe},
    config::SwitcherConfig,
    error::SwitcherError,
};

const SOCKET_AFTER_SWITCH_TIMEOUT_MS: u64 = 10_000;
const SOCKET_POLL_INTERVAL_MS: u64 = 100;

/// Rotation pool, usage/failure counters, and the `isSystemBusy` interlock.
pub struct Switcher {
    config: SwitcherConfig,
    backend: Arc<dyn ActivationBackend>,
    sockets: Arc<dyn SocketProbe>,
    /// Rotation list, ordered and deduplicated by email (§4.D). `RwLock` rather than
    /// `ArcSwap` since membership only changes on operator action (identity add/remove),
    /// far rarer than the reads/mutations of the counters below.
    rotation: RwLock<Vec<Identity>>,
    /// Position within `rotation`, `-1` when no identity is active (`currentAuthIndex = -1`
    /// in the distilled spec's terms).
    current_position: AtomicI64,
    usage_count: AtomicU32,
    failure_count: AtomicU32,
    is_busy: AtomicBool,
}

/// Set by [`Switcher::increment_usage`] when the usage-based rotation threshold is crossed;
/// the pipeline consults this in its `finally` block rather than rotating mid-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageOutcome {
    pub usage_count: u32,
    pub needs_switch: bool,
}

/// Set by [`Switcher::record_failure`] to tell the caller which rotation (if any) to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    NoRotation,
    RotateImmediately,
    RotateAfterThreshold,
}

impl Switcher {
    pub fn new(
        config: SwitcherConfig,
        backend: Arc<dyn ActivationBackend>,
        sockets: Arc<dyn SocketProbe>,
        rotation: Vec<Identity>,
    ) -> Self {
        Self {
            config,
            backend,
            sockets,
            rotation: RwLock::new(dedup_by_email(rotation)),
            current_position: AtomicI64::new(-1),
            usage_count: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            is_busy: AtomicBool::new(false),
        }
    }

    pub async fn current_auth_index(&self) -> Option<u32> {
        let position = self.current_position.load(Ordering::SeqCst);
        if position < 0 {
            return None;
        }
        self.rotation
            .read()
            .await
            .get(position as usize)
            .map(|identity| identity.auth_index)
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy.load(Ordering::SeqCst)
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub async fn rotation_len(&self) -> usize {
        self.rotation.read().await.len()
    }

    /// Snapshot of the identity at `currentAuthIndex`, if any. Used by the pipeline's
    /// direct-recovery path (§4.E.1), which needs the full [`Identity`] — cookies and
    /// origins included — to hand to `Manager.launchOrSwitchContext`, not just the index.
    pub async fn current_identity(&self) -> Option<Identity> {
        let position = self.current_position.load(Ordering::SeqCst);
        if position < 0 {
            return None;
        }
        self.rotation.read().await.get(position as usize).cloned()
    }

    /// §4.D `incrementUsage()`. Called once per generative request.
    pub fn increment_usage(&self) -> UsageOutcome {
        let usage_count = self.usage_count.fetch_add(1, Ordering::SeqCst) + 1;
        let needs_switch = self.config.switch_on_uses > 0 && usage_count >= self.config.switch_on_uses;
        UsageOutcome {
            usage_count,
            needs_switch,
        }
    }

    /// §4.D `recordSuccess()`. A request's initial frame dequeued successfully (§3 invariant).
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
    }

    /// §4.D `recordFailure(status)`.
    pub fn record_failure(&self, status: u16) -> FailureOutcome {
        if self.config.immediate_switch_status_codes.contains(&status) {
            return FailureOutcome::RotateImmediately;
        }
        let failure_count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.failure_threshold > 0 && failure_count >= self.config.failure_threshold {
            FailureOutcome::RotateAfterThreshold
        } else {
            FailureOutcome::NoRotation
        }
    }

    /// Resets the usage counter after a rotation actually runs, so the next identity starts
    /// from zero rather than immediately re-triggering `switch_on_uses`.
    fn reset_counters_after_rotation(&self) {
        self.usage_count.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
    }

    /// §4.D `switchToNext()`. Fails with [`SwitcherError::AlreadyInProgress`] if a switch or
    /// direct recovery already owns the interlock; otherwise tries each identity starting
    /// from `(currentPosition + 1) mod N`, returning the first that activates successfully.
    /// On total failure, `currentAuthIndex` resets to `-1` (§3 invariant).
    pub async fn switch_to_next(&self) -> Result<u32, SwitcherError> {
        if self
            .is_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SwitcherError::AlreadyInProgress);
        }

        let result = self.rotate_from_next().await;

        self.is_busy.store(false, Ordering::SeqCst);
        result
    }

    async fn rotate_from_next(&self) -> Result<u32, SwitcherError> {
        let rotation = self.rotation.read().await.clone();
        if rotation.is_empty() {
            self.current_position.store(-1, Ordering::SeqCst);
            return Err(SwitcherError::NoViableIdentity);
        }

        let start = {
            let current = self.current_position.load(Ordering::SeqCst);
            if current < 0 {
                0
            } else {
                (current as usize + 1) % rotation.len()
            }
        };

        for offset in 0..rotation.len() {
            let position = (start + offset) % rotation.len();
            let identity = &rotation[position];
            match self.backend.activate(identity).await {
                Ok(()) => {
                    if self
                        .wait_for_socket(identity.auth_index)
                        .await
                        .is_ok()
                    {
                        self.current_position.store(position as i64, Ordering::SeqCst);
                        self.reset_counters_after_rotation();
                        info!(auth_index = identity.auth_index, "switched to identity");
                        return Ok(identity.auth_index);
                    }
                    warn!(
                        auth_index = identity.auth_index,
                        "activation reported success but no socket appeared"
                    );
                }
                Err(err) => {
                    warn!(auth_index = identity.auth_index, error = %err, "activation failed during rotation");
                }
            }
        }

        self.current_position.store(-1, Ordering::SeqCst);
        Err(SwitcherError::NoViableIdentity)
    }

    /// §4.D `switchToSpecific(target)`. Same interlock semantics as [`Switcher::switch_to_next`]
    /// but does not advance through the rotation — it activates exactly `target`.
    pub async fn switch_to_specific(&self, target: u32) -> Result<u32, SwitcherError> {
        if self
            .is_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SwitcherError::AlreadyInProgress);
        }

        let result = self.activate_specific(target).await;

        self.is_busy.store(false, Ordering::SeqCst);
        result
    }

    async fn activate_specific(&self, target: u32) -> Result<u32, SwitcherError> {
        let rotation = self.rotation.read().await.clone();
        let Some(position) = rotation.iter().position(|i| i.auth_index == target) else {
            return Err(SwitcherError::NoViableIdentity);
        };
        let identity = &rotation[position];

        self.backend
            .activate(identity)
            .await
            .map_err(|err| SwitcherError::ActivationFailed(err.to_string()))?;
        self.wait_for_socket(target)
            .await
            .map_err(|_| SwitcherError::ActivationFailed("no socket after activation".into()))?;

        self.current_position.store(position as i64, Ordering::SeqCst);
        self.reset_counters_after_rotation();
        Ok(target)
    }

    /// §4.E.1 direct-recovery entry point: the *only* sanctioned external setter of the
    /// interlock besides the two `switch_to_*` methods above. Returns `false` without
    /// mutating anything if a switch/recovery is already in flight — the caller falls
    /// through to rotation in that case rather than racing it.
    pub fn begin_direct_recovery(&self) -> bool {
        self.is_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_direct_recovery(&self) {
        self.is_busy.store(false, Ordering::SeqCst);
    }

    async fn wait_for_socket(&self, auth_index: u32) -> Result<(), SwitcherError> {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(SOCKET_AFTER_SWITCH_TIMEOUT_MS);
        loop {
            if self.sockets.has_socket(auth_index) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SwitcherError::ActivationFailed(format!(
                    "no socket for auth_index {auth_index} within timeout"
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(SOCKET_POLL_INTERVAL_MS)).await;
        }
    }
}

/// Keeps the first occurrence of each email (case-insensitive, None/empty treated as
/// always-unique so anonymous identities are never accidentally collapsed together).
fn dedup_by_email(identities: Vec<Identity>) -> Vec<Identity> {
    let mut seen = std::collections::HashSet::new();
    identities
        .into_iter()
        .filter(|identity| match &identity.email {
            Some(email) if !email.trim().is_empty() => seen.insert(email.trim().to_lowercase()),
            _ => true,
        })
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_config::IdentityState;
    use std::sync::atomic::AtomicUsize;

    fn identity(auth_index: u32, email: &str) -> Identity {
        Identity {
            auth_index,
            email: Some(email.into()),
            state: IdentityState {
                cookies: vec![],
                origins: vec![],
                account_name: None,
                app_url: None,
            },
        }
    }

    struct FakeBackend {
        fails_for: Vec<u32>,
        activations: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ActivationBackend for FakeBackend {
        async fn activate(&self, identity: &Identity) -> Result<(), relaygate_browser::BrowserError> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.fails_for.contains(&identity.auth_index) {
                Err(relaygate_browser::BrowserError::BrowserNotAvailable)
            } else {
                Ok(())
            }
        }

        async fn launch_or_switch_context(
            &self,
            identity: &Identity,
        ) -> Result<(), relaygate_browser::BrowserError> {
            self.activate(identity).await
        }
    }

    struct FakeSockets {
        live: std::sync::Mutex<std::collections::HashSet<u32>>,
    }

    impl SocketProbe for FakeSockets {
        fn has_socket(&self, auth_index: u32) -> bool {
            self.live.lock().unwrap().contains(&auth_index)
        }
    }

    fn sockets_live_for_all() -> Arc<FakeSockets> {
        Arc::new(FakeSockets {
            live: std::sync::Mutex::new([0, 1, 2].into_iter().collect()),
        })
    }

    #[tokio::test]
    async fn switch_to_next_advances_from_current_position() {
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(
            SwitcherConfig::default(),
            backend,
            sockets_live_for_all(),
            vec![identity(0, "a@x.com"), identity(1, "b@x.com"), identity(2, "c@x.com")],
        );

        let first = switcher.switch_to_next().await.unwrap();
        assert_eq!(first, 0);
        let second = switcher.switch_to_next().await.unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn switch_to_next_skips_failing_identities() {
        let backend = Arc::new(FakeBackend {
            fails_for: vec![0],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(
            SwitcherConfig::default(),
            backend,
            sockets_live_for_all(),
            vec![identity(0, "a@x.com"), identity(1, "b@x.com")],
        );

        let chosen = switcher.switch_to_next().await.unwrap();
        assert_eq!(chosen, 1);
    }

    #[tokio::test]
    async fn switch_to_next_rejects_when_already_busy() {
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Arc::new(Switcher::new(
            SwitcherConfig::default(),
            backend,
            sockets_live_for_all(),
            vec![identity(0, "a@x.com")],
        ));
        assert!(switcher.begin_direct_recovery());
        let err = switcher.switch_to_next().await.unwrap_err();
        assert!(matches!(err, SwitcherError::AlreadyInProgress));
        switcher.end_direct_recovery();
    }

    #[tokio::test]
    async fn switch_to_next_with_empty_rotation_resets_to_none() {
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(SwitcherConfig::default(), backend, sockets_live_for_all(), vec![]);
        let err = switcher.switch_to_next().await.unwrap_err();
        assert!(matches!(err, SwitcherError::NoViableIdentity));
        assert_eq!(switcher.current_auth_index().await, None);
    }

    #[test]
    fn increment_usage_flags_switch_at_threshold() {
        let config = SwitcherConfig {
            switch_on_uses: 3,
            ..SwitcherConfig::default()
        };
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(config, backend, sockets_live_for_all(), vec![]);
        assert!(!switcher.increment_usage().needs_switch);
        assert!(!switcher.increment_usage().needs_switch);
        assert!(switcher.increment_usage().needs_switch);
    }

    #[test]
    fn record_failure_immediate_status_rotates_without_threshold() {
        let config = SwitcherConfig {
            failure_threshold: 10,
            immediate_switch_status_codes: vec![429],
            ..SwitcherConfig::default()
        };
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(config, backend, sockets_live_for_all(), vec![]);
        assert_eq!(switcher.record_failure(429), FailureOutcome::RotateImmediately);
    }

    #[test]
    fn record_failure_accumulates_to_threshold() {
        let config = SwitcherConfig {
            failure_threshold: 2,
            immediate_switch_status_codes: vec![],
            ..SwitcherConfig::default()
        };
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(config, backend, sockets_live_for_all(), vec![]);
        assert_eq!(switcher.record_failure(500), FailureOutcome::NoRotation);
        assert_eq!(switcher.record_failure(500), FailureOutcome::RotateAfterThreshold);
    }

    #[test]
    fn record_success_resets_failure_count() {
        let config = SwitcherConfig {
            failure_threshold: 2,
            immediate_switch_status_codes: vec![],
            ..SwitcherConfig::default()
        };
        let backend = Arc::new(FakeBackend {
            fails_for: vec![],
            activations: AtomicUsize::new(0),
        });
        let switcher = Switcher::new(config, backend, sockets_live_for_all(), vec![]);
        switcher.record_failure(500);
        switcher.record_success();
        assert_eq!(switcher.failure_count(), 0);
    }

    #[test]
    fn dedup_by_email_keeps_first_occurrence() {
        let list = vec![
            identity(0, "same@x.com"),
            identity(1, "Same@X.com"),
            identity(2, "other@x.com"),
        ];
        let deduped = dedup_by_email(list);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].auth_index, 0);
        assert_eq!(deduped[1].auth_index, 2);
    }
}
