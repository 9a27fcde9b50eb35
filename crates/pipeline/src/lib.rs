//! Request Pipeline (§4.E): dialect translation, body rewrites, the readiness/attempt-loop
//! skeleton shared by all three inbound dialects, and streaming-mode response shaping.

mod config;
mod dialect;
mod error;
mod model;
mod pipeline;
mod rewrite;
mod streaming;

pub use config::PipelineConfig;
pub use dialect::{Dialect, DialectAdapter, DialectStreamState, Translated, adapter_for};
pub use error::PipelineError;
pub use model::parse_model_and_thinking_level;
pub use pipeline::{AttemptOutcome, Pipeline};
pub use rewrite::{ForceFlags, apply_body_rewrites};
pub use streaming::{
    build_pseudo_stream_records, rewrite_inline_images, sse_comment_line, sse_data_line, sse_sentinel_line,
};
