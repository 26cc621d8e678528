//! Trace-context propagation codec
//!
//! Encodes and decodes trace identifiers across process and network
//! boundaries so that work done in separate services is correlated into one
//! distributed trace.
//!
//! # Supported Header Formats
//!
//! - **W3C Trace Context**: the `traceparent` header
//!   (`00-{trace-id}-{span-id}-{trace-flags}`) plus the optional opaque
//!   `tracestate` header. See the [W3C Trace Context](https://www.w3.org/TR/trace-context/)
//!   specification.
//! - **B3 (Zipkin)**: the multi-header form: `X-B3-TraceId`, `X-B3-SpanId`,
//!   `X-B3-Sampled` (`"1"`/`"0"`) and the optional `X-B3-ParentSpanId`.
//!
//! Extraction tries W3C first and falls back to B3. Malformed input never
//! raises; it yields `None`.
//!
//! # Validation Rules
//!
//! - The `traceparent` version byte must be `"00"`.
//! - Trace ids are exactly 32 lowercase hex characters, span ids exactly 16.
//! - All-zero ids are invalid.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use kodama_telemetry::propagation::{extract, inject, PropagationContext, PropagationFormat};
//!
//! let parent = PropagationContext::generate(true);
//!
//! let mut headers = HashMap::new();
//! inject(&mut headers, &parent, PropagationFormat::W3c);
//!
//! let recovered = extract(&headers).unwrap();
//! assert_eq!(recovered.trace_id, parent.trace_id);
//! assert_eq!(recovered.span_id, parent.span_id);
//! assert!(recovered.sampled);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `traceparent` header name (W3C)
pub const TRACEPARENT: &str = "traceparent";
/// `tracestate` header name (W3C)
pub const TRACESTATE: &str = "tracestate";
/// B3 trace id header name
pub const B3_TRACE_ID: &str = "X-B3-TraceId";
/// B3 span id header name
pub const B3_SPAN_ID: &str = "X-B3-SpanId";
/// B3 sampled flag header name
pub const B3_SAMPLED: &str = "X-B3-Sampled";
/// B3 parent span id header name
pub const B3_PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";

/// Header format selection for [`inject`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationFormat {
    /// W3C `traceparent`/`tracestate` only (default)
    #[default]
    W3c,
    /// B3 multi-header only
    B3,
    /// Both W3C and B3 headers
    All,
}

/// Minimal trace identity correlating work across boundaries
///
/// Invariants: `trace_id` is 32 lowercase hex characters, `span_id` is 16,
/// and neither is all-zero. Construct via [`PropagationContext::generate`],
/// [`extract`] or [`child_context`] to preserve them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationContext {
    /// 128-bit trace id (32 lowercase hex characters)
    pub trace_id: String,
    /// 64-bit span id (16 lowercase hex characters)
    pub span_id: String,
    /// Span id of the caller's span, when known
    pub parent_span_id: Option<String>,
    /// Sampling decision propagated with the trace
    pub sampled: bool,
    /// Opaque vendor state (`tracestate` passthrough)
    pub vendor_state: Option<String>,
}

impl PropagationContext {
    /// Generate a fresh root context with new trace and span ids
    pub fn generate(sampled: bool) -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            sampled,
            vendor_state: None,
        }
    }

    /// Format as a `traceparent` header value
    ///
    /// The sampled flag is encoded as bit 0 of the trace-flags byte.
    pub fn to_traceparent(&self) -> String {
        let flags: u8 = if self.sampled { 0x01 } else { 0x00 };
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, flags)
    }
}

/// Derive a child context from `parent`
///
/// The child shares the parent's trace id, sampling decision and vendor
/// state, records the parent's span id as `parent_span_id`, and gets a
/// fresh span id.
///
/// # Example
///
/// ```
/// use kodama_telemetry::propagation::{child_context, PropagationContext};
///
/// let parent = PropagationContext::generate(true);
/// let child = child_context(&parent);
///
/// assert_eq!(child.trace_id, parent.trace_id);
/// assert_eq!(child.parent_span_id.as_deref(), Some(parent.span_id.as_str()));
/// assert_ne!(child.span_id, parent.span_id);
/// ```
pub fn child_context(parent: &PropagationContext) -> PropagationContext {
    PropagationContext {
        trace_id: parent.trace_id.clone(),
        span_id: generate_span_id(),
        parent_span_id: Some(parent.span_id.clone()),
        sampled: parent.sampled,
        vendor_state: parent.vendor_state.clone(),
    }
}

/// Inject a propagation context into an outgoing header map
///
/// Writes W3C headers, B3 headers, or both depending on `format`. Existing
/// entries under the same names are overwritten.
pub fn inject(
    headers: &mut HashMap<String, String>,
    context: &PropagationContext,
    format: PropagationFormat,
) {
    if matches!(format, PropagationFormat::W3c | PropagationFormat::All) {
        headers.insert(TRACEPARENT.to_string(), context.to_traceparent());
        if let Some(ref state) = context.vendor_state {
            headers.insert(TRACESTATE.to_string(), state.clone());
        }
    }

    if matches!(format, PropagationFormat::B3 | PropagationFormat::All) {
        headers.insert(B3_TRACE_ID.to_string(), context.trace_id.clone());
        headers.insert(B3_SPAN_ID.to_string(), context.span_id.clone());
        headers.insert(
            B3_SAMPLED.to_string(),
            if context.sampled { "1" } else { "0" }.to_string(),
        );
        if let Some(ref parent) = context.parent_span_id {
            headers.insert(B3_PARENT_SPAN_ID.to_string(), parent.clone());
        }
    }
}

/// Extract a propagation context from an incoming header map
///
/// Tries W3C `traceparent` first, then the B3 multi-header form. Header
/// names are matched case-insensitively. Returns `None` when neither format
/// yields a valid context; malformed values never panic.
pub fn extract(headers: &HashMap<String, String>) -> Option<PropagationContext> {
    extract_w3c(headers).or_else(|| extract_b3(headers))
}

/// Extract from the W3C `traceparent`/`tracestate` headers only
pub fn extract_w3c(headers: &HashMap<String, String>) -> Option<PropagationContext> {
    let traceparent = get_header(headers, TRACEPARENT)?;

    // version-trace_id-span_id-trace_flags, all fields mandatory
    let parts: Vec<&str> = traceparent.split('-').collect();
    if parts.len() != 4 {
        return None;
    }

    if parts[0] != "00" {
        return None;
    }

    if !is_valid_trace_id(parts[1]) || !is_valid_span_id(parts[2]) {
        return None;
    }

    if parts[3].len() != 2 || !is_lowercase_hex(parts[3]) {
        return None;
    }
    let flags = u8::from_str_radix(parts[3], 16).ok()?;

    let vendor_state = get_header(headers, TRACESTATE).map(|v| v.to_string());

    Some(PropagationContext {
        trace_id: parts[1].to_string(),
        span_id: parts[2].to_string(),
        parent_span_id: None,
        sampled: (flags & 0x01) != 0,
        vendor_state,
    })
}

/// Extract from the B3 multi-header form only
pub fn extract_b3(headers: &HashMap<String, String>) -> Option<PropagationContext> {
    let trace_id = get_header(headers, B3_TRACE_ID)?;
    let span_id = get_header(headers, B3_SPAN_ID)?;

    if !is_valid_trace_id(trace_id) || !is_valid_span_id(span_id) {
        return None;
    }

    // Absent means the caller deferred the decision; present must be "1"/"0".
    let sampled = match get_header(headers, B3_SAMPLED) {
        Some("1") => true,
        Some("0") | None => false,
        Some(_) => return None,
    };

    let parent_span_id = match get_header(headers, B3_PARENT_SPAN_ID) {
        Some(parent) if is_valid_span_id(parent) => Some(parent.to_string()),
        Some(_) => return None,
        None => None,
    };

    Some(PropagationContext {
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
        parent_span_id,
        sampled,
        vendor_state: None,
    })
}

/// Generate a fresh 32-character lowercase hex trace id
///
/// Backed by UUIDv4 bytes, so the id is never all-zero.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a fresh 16-character lowercase hex span id
pub fn generate_span_id() -> String {
    // The UUIDv4 version nibble falls inside the first 16 characters, so a
    // truncated simple encoding can never be all-zero either.
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Case-insensitive header lookup
fn get_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn is_lowercase_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

/// Validate a 32-character lowercase hex trace id
pub fn is_valid_trace_id(s: &str) -> bool {
    s.len() == 32 && is_lowercase_hex(s) && !is_all_zero(s)
}

/// Validate a 16-character lowercase hex span id
pub fn is_valid_span_id(s: &str) -> bool {
    s.len() == 16 && is_lowercase_hex(s) && !is_all_zero(s)
}
