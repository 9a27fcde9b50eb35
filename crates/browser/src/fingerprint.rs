//! Fingerprint stealth script (§4.C.4). The script is injected once per context, before any
//! page script runs, via the CDP `Page.addScriptToEvaluateOnNewDocument` call.

use sha2::{Digest, Sha256};

/// One of three stable WebGL vendor/renderer profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuProfile {
    Intel,
    Nvidia,
    Amd,
}

impl GpuProfile {
    fn vendor_renderer(self) -> (&'static str, &'static str) {
        match self {
            GpuProfile::Intel => ("Intel Inc.", "Intel Iris OpenGL Engine"),
            GpuProfile::Nvidia => ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
            GpuProfile::Amd => ("Google Inc. (AMD)", "ANGLE (AMD, AMD Radeon RX 580 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
        }
    }
}

/// Deterministically derives a [`GpuProfile`] and a benign canvas-noise value from `seed`
/// (the identity's lower-cased/trimmed email, or its index if no email is known — see
/// [`crate::types::Identity::fingerprint_seed`]). Stable across restarts for the same seed.
pub fn derive(seed: &str) -> (GpuProfile, f64) {
    let digest = Sha256::digest(seed.as_bytes());
    let first_byte = digest[0];
    let profile = match first_byte % 3 {
        0 => GpuProfile::Intel,
        1 => GpuProfile::Nvidia,
        _ => GpuProfile::Amd,
    };

    // Fold the next four bytes into a small, deterministic noise value in [0, 1).
    let noise_bytes: [u8; 4] = digest[1..5].try_into().unwrap_or([0; 4]);
    let noise = (u32::from_be_bytes(noise_bytes) as f64) / (u32::MAX as f64);

    (profile, noise)
}

/// Renders the injectable stealth script for `seed`.
pub fn script_for_seed(seed: &str) -> String {
    let (profile, noise) = derive(seed);
    let (vendor, renderer) = profile.vendor_renderer();

    format!(
        r#"(() => {{
  try {{ Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }}); }} catch (e) {{}}
  try {{
    if (navigator.plugins && navigator.plugins.length === 0) {{
      Object.defineProperty(navigator, 'plugins', {{ get: () => new Array(3) }});
    }}
  }} catch (e) {{}}
  const canvasNoise = {noise};
  const vendor = {vendor:?};
  const renderer = {renderer:?};
  const patchContext = (proto) => {{
    const original = proto.getParameter;
    proto.getParameter = function(param) {{
      if (param === 37445) return vendor;
      if (param === 37446) return renderer;
      return original.apply(this, arguments);
    }};
  }};
  try {{ patchContext(WebGLRenderingContext.prototype); }} catch (e) {{}}
  try {{ patchContext(WebGL2RenderingContext.prototype); }} catch (e) {{}}
  try {{
    const origToDataURL = HTMLCanvasElement.prototype.toDataURL;
    HTMLCanvasElement.prototype.toDataURL = function(...args) {{
      const ctx = this.getContext('2d');
      if (ctx) {{
        const imageData = ctx.getImageData(0, 0, this.width, this.height);
        const i = Math.floor(canvasNoise * imageData.data.length);
        imageData.data[i] = (imageData.data[i] + 1) % 256;
        ctx.putImageData(imageData, 0, 0);
      }}
      return origToDataURL.apply(this, args);
    }};
  }} catch (e) {{}}
}})();"#
    )
}
