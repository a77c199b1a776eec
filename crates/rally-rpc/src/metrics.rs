//! Names of the metrics recorded by method dispatch.

/// RPC calls dispatched (counter, labels: method).
pub const RPC_CALLS_TOTAL: &str = "rpc_calls_total";
/// RPC calls answered with an error (counter, labels: method).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// RPC handler duration seconds (histogram, labels: method).
pub const RPC_CALL_DURATION_SECONDS: &str = "rpc_call_duration_seconds";
