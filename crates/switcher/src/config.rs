/// Rotation/retry knobs (§4.D), sourced from [`relaygate_config::Config`].
#[derive(Debug, Clone)]
pub struct SwitcherConfig {
    /// `0` disables usage-based rotation.
    pub switch_on_uses: u32,
    /// `0` disables failure-count rotation.
    pub failure_threshold: u32,
    pub immediate_switch_status_codes: Vec<u16>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            switch_on_uses: 0,
            failure_threshold: 0,
            immediate_switch_status_codes: vec![401, 403, 429],
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl From<&relaygate_config::Config> for SwitcherConfig {
    fn from(config: &relaygate_config::Config) -> Self {
        Self {
            switch_on_uses: config.switch_on_uses,
            failure_threshold: config.failure_threshold,
            immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        }
    }
}
