//! Trace-context propagation into child processes.
//!
//! The current span context is serialised, base64-encoded, and exported
//! to children in `BUILDKITE_TRACE_CONTEXT`; hooks and commands started
//! by the job decode it to continue the trace. The codec sits behind a
//! trait so the wire form can vary per tracing backend.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Environment variable carrying the encoded span context.
pub const TRACE_CONTEXT_ENV: &str = "BUILDKITE_TRACE_CONTEXT";

/// A propagated span context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl SpanContext {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty() && self.span_id.is_empty()
    }
}

/// Encodes a span context to its environment-variable form and back.
pub trait TraceCodec: Send + Sync {
    fn encode(&self, ctx: &SpanContext) -> Result<String>;
    fn decode(&self, encoded: &str) -> Result<SpanContext>;
}

/// JSON payload, base64-encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl TraceCodec for JsonCodec {
    fn encode(&self, ctx: &SpanContext) -> Result<String> {
        let json = serde_json::to_vec(ctx).context("failed to serialize span context")?;
        Ok(STANDARD.encode(json))
    }

    fn decode(&self, encoded: &str) -> Result<SpanContext> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("trace context is not valid base64")?;
        serde_json::from_slice(&bytes).context("trace context payload is not valid JSON")
    }
}

/// Telemetry capability injected into the executor. The backend is an
/// external collaborator; the core only needs the current context for
/// propagation and phase boundary marks.
pub trait TraceRecorder: Send {
    /// Context to propagate to children, if a trace is active.
    fn current_context(&self) -> Option<SpanContext>;
    /// Mark the start of a named phase.
    fn phase_started(&mut self, phase: &str);
    /// Mark the end of the most recent phase, with its outcome.
    fn phase_finished(&mut self, phase: &str, ok: bool);
}

/// Recorder that drops everything; used when tracing is not configured.
#[derive(Debug, Default)]
pub struct NoopTraceRecorder;

impl TraceRecorder for NoopTraceRecorder {
    fn current_context(&self) -> Option<SpanContext> {
        None
    }

    fn phase_started(&mut self, _phase: &str) {}

    fn phase_finished(&mut self, _phase: &str, _ok: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_roundtrips() {
        let mut attributes = BTreeMap::new();
        attributes.insert("job.id".to_string(), "0199-abc".to_string());
        let ctx = SpanContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            attributes,
        };

        let codec = JsonCodec;
        let encoded = codec.encode(&ctx).expect("encode");
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, ctx);
    }

    #[test]
    fn encoded_form_is_base64() {
        let codec = JsonCodec;
        let encoded = codec.encode(&SpanContext::default()).expect("encode");
        assert!(STANDARD.decode(&encoded).is_ok());
        assert!(!encoded.contains('{'));
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = JsonCodec;
        assert!(codec.decode("not-base64!!!").is_err());
        let not_json = STANDARD.encode(b"plain text");
        assert!(codec.decode(&not_json).is_err());
    }

    #[test]
    fn empty_context_reports_empty() {
        assert!(SpanContext::default().is_empty());
    }
}
