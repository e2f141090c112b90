pub mod logging;
pub mod trace_context;

pub use logging::init_tracing;
pub use trace_context::{
    REQUEST_ID, REQUEST_ID_HEADER, TRACEPARENT_HEADER, current_request_id, inject_trace_headers,
};
