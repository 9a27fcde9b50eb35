use crate::schema::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Checks a loaded [`Config`] for conditions that would make the server non-functional
/// (`Severity::Error`) or that are legal but surprising (`Severity::Warning`).
pub fn validate(config: &Config) -> ValidationResult {
    let mut diagnostics = Vec::new();

    if config.api_keys.is_empty() {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message: "no api_keys configured; every request will be rejected".into(),
        });
    }

    let http_port = config
        .listen_addr
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse::<u16>().ok());
    if http_port == Some(config.agent_ws_port) {
        diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message: format!(
                "listen_addr and agent_ws_port both use port {}",
                config.agent_ws_port
            ),
        });
    }

    if config.switch_on_uses == 0 && config.failure_threshold == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message: "switch_on_uses and failure_threshold are both 0; rotation never \
                      triggers automatically"
                .into(),
        });
    }

    if config.max_retries == 0 {
        diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message: "max_retries is 0; a single upstream error will fail the request".into(),
        });
    }

    ValidationResult { diagnostics }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_keys_is_an_error() {
        let config = Config::default();
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn colliding_ports_is_an_error() {
        let mut config = Config {
            api_keys: vec!["k".to_string().into()],
            ..Config::default()
        };
        config.listen_addr = "0.0.0.0:9998".into();
        config.agent_ws_port = 9998;
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn sane_config_has_no_errors() {
        let mut config = Config {
            api_keys: vec!["k".to_string().into()],
            ..Config::default()
        };
        config.switch_on_uses = 50;
        let result = validate(&config);
        assert!(!result.has_errors());
    }
}
