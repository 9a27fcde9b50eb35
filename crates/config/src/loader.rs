use std::path::{Path, PathBuf};

use relaygate_common::{Result, impl_context};

use crate::{env_subst::substitute_env, schema::Config};

impl_context!(relaygate_common::Error);

const CONFIG_FILE_NAME: &str = "relaygate.toml";

/// Searches `./relaygate.toml` then `$XDG_CONFIG_HOME/relaygate/relaygate.toml` (falling back
/// to `~/.config/relaygate/relaygate.toml`), returning the first path that exists.
pub fn discover_config_path() -> Option<PathBuf> {
    let cwd_candidate = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_candidate.is_file() {
        return Some(cwd_candidate);
    }

    let config_home = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| Path::new(&h).join(".config")))?;

    let candidate = config_home.join("relaygate").join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

/// Loads configuration from the discovered file (if any), applies `${VAR}` substitution,
/// then layers per-field `RELAYGATE_*` environment overrides on top.
pub fn load() -> Result<Config> {
    let mut config = match discover_config_path() {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .context(format!("reading config file {}", path.display()))?;
            let substituted = substitute_env(&raw);
            toml::from_str(&substituted)
                .context(format!("parsing config file {}", path.display()))?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("RELAYGATE_LISTEN_ADDR") {
        config.listen_addr = v;
    }
    if let Ok(v) = std::env::var("RELAYGATE_AGENT_WS_PORT")
        && let Ok(parsed) = v.parse()
    {
        config.agent_ws_port = parsed;
    }
    if let Ok(v) = std::env::var("RELAYGATE_API_KEYS") {
        config.api_keys = v.split(',').map(|s| s.trim().to_string().into()).collect();
    }
    if let Ok(v) = std::env::var("RELAYGATE_SWITCH_ON_USES")
        && let Ok(parsed) = v.parse()
    {
        config.switch_on_uses = parsed;
    }
    if let Ok(v) = std::env::var("RELAYGATE_FAILURE_THRESHOLD")
        && let Ok(parsed) = v.parse()
    {
        config.failure_threshold = parsed;
    }
    if let Ok(v) = std::env::var("RELAYGATE_MAX_RETRIES")
        && let Ok(parsed) = v.parse()
    {
        config.max_retries = parsed;
    }
    if let Ok(v) = std::env::var("RELAYGATE_RETRY_DELAY_MS")
        && let Ok(parsed) = v.parse()
    {
        config.retry_delay_ms = parsed;
    }
    if let Ok(v) = std::env::var("RELAYGATE_BROWSER_PROXY_URL") {
        config.browser_proxy_url = Some(v);
    }
    if let Ok(v) = std::env::var("RELAYGATE_ENABLE_AUTH_UPDATE") {
        config.enable_auth_update = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_defaults() {
        let config = Config::default();
        assert_eq!(config.agent_ws_port, 9998);
        assert_eq!(config.max_retries, 3);
        assert!(config.immediate_switch_status_codes.contains(&429));
    }

    #[test]
    fn env_override_wins_over_file_default() {
        let mut config = Config::default();
        // SAFETY: test-only process-wide env mutation, no concurrent access in this test.
        unsafe { std::env::set_var("RELAYGATE_MAX_RETRIES", "9") };
        apply_env_overrides(&mut config);
        unsafe { std::env::remove_var("RELAYGATE_MAX_RETRIES") };
        assert_eq!(config.max_retries, 9);
    }
}
