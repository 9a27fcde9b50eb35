use crate::rewrite::ForceFlags;

/// Pipeline-relevant slice of [`relaygate_config::Config`] (§12).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub default_streaming_mode: relaygate_protocol::StreamingMode,
    pub immediate_switch_status_codes: Vec<u16>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub force: ForceFlags,
}

impl From<&relaygate_config::Config> for PipelineConfig {
    fn from(config: &relaygate_config::Config) -> Self {
        let default_streaming_mode = if config.default_streaming_mode.eq_ignore_ascii_case("fake") {
            relaygate_protocol::StreamingMode::Fake
        } else {
            relaygate_protocol::StreamingMode::Real
        };
        Self {
            default_streaming_mode,
            immediate_switch_status_codes: config.immediate_switch_status_codes.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            force: ForceFlags {
                thinking: config.force_thinking,
                web_search: config.force_web_search,
                url_context: config.force_url_context,
            },
        }
    }
}
