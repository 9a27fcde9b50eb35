//! In-page Agent Contract (§4.F): the URL-rewrite/header-sanitation rules shared bit-for-bit
//! with the embedded JavaScript asset, plus the asset itself.

mod rewrite;
mod source;

pub use rewrite::{rewrite_upstream_location, resolve_target_host, sanitize_request_headers, sanitize_response_headers};
pub use source::AGENT_SOURCE;
