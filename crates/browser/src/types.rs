use relaygate_config::IdentityState;

/// One persisted user account on the upstream: an integer index plus the state needed to
/// restore its browser context, and an optional email used to derive a stable fingerprint
/// seed.
#[derive(Debug, Clone)]
pub struct Identity {
    pub auth_index: u32,
    pub email: Option<String>,
    pub state: IdentityState,
}

impl Identity {
    /// Stable seed for fingerprint determinism: the lower-cased, trimmed email if present,
    /// else the index. Must not change across restarts for the same identity (§4.C.4, §9).
    pub fn fingerprint_seed(&self) -> String {
        match &self.email {
            Some(email) if !email.trim().is_empty() => email.trim().to_lowercase(),
            _ => self.auth_index.to_string(),
        }
    }
}

/// Launch-time preferences bundle (§6 "Browser preferences injected at launch"). Carried as
/// a flat struct rather than a raw flag list so call sites read as intent, not magic strings.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub proxy_url: Option<String>,
    pub disable_update: bool,
    pub disable_disk_cache: bool,
    pub disable_telemetry: bool,
    pub disable_safe_browsing: bool,
    pub disable_prefetch: bool,
    pub disable_geolocation: bool,
    pub disable_smooth_scroll: bool,
    pub disable_gpu: bool,
    pub autoplay_policy: &'static str,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            proxy_url: None,
            disable_update: true,
            disable_disk_cache: true,
            disable_telemetry: true,
            disable_safe_browsing: true,
            disable_prefetch: true,
            disable_geolocation: true,
            disable_smooth_scroll: true,
            disable_gpu: true,
            autoplay_policy: "no-user-gesture-required-block-all",
        }
    }
}

impl BrowserConfig {
    /// Flattens this config into the `--disable-*` / `--autoplay-policy=*` command line
    /// switches `chromiumoxide::BrowserConfig` accepts as extra launch args.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.disable_update {
            args.push("--disable-component-update".into());
        }
        if self.disable_disk_cache {
            args.push("--disk-cache-size=0".into());
        }
        if self.disable_telemetry {
            args.push("--disable-background-networking".into());
            args.push("--metrics-recording-only".into());
        }
        if self.disable_safe_browsing {
            args.push("--safebrowsing-disable-auto-update".into());
        }
        if self.disable_prefetch {
            args.push("--disable-features=NetworkPrediction".into());
        }
        if self.disable_geolocation {
            args.push("--disable-geolocation".into());
        }
        if self.disable_smooth_scroll {
            args.push("--disable-smooth-scrolling".into());
        }
        if self.disable_gpu {
            args.push("--disable-gpu".into());
        }
        args.push(format!("--autoplay-policy={}", self.autoplay_policy));
        args.push("--disable-sync".into());
        if let Some(proxy) = &self.proxy_url {
            args.push(format!("--proxy-server={proxy}"));
        }
        args
    }
}

/// Which flavour of the upstream web editor an activation is dealing with (§4.C.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorFlavor {
    Legacy,
    Remix,
}

/// Result of a completed activation: the identity is now "agent-live".
#[derive(Debug, Clone)]
pub struct ActivationOutcome {
    pub auth_index: u32,
    pub flavor: EditorFlavor,
    pub app_url: Option<String>,
}
