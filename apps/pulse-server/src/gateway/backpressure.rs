use crate::config::BackpressureConfig;

/// Whether a connection's outbound buffer is too full to accept pushes.
///
/// Only pushes are subject to this check; request/response traffic is
/// bounded and always sent.
pub fn is_backpressured(buffered_bytes: usize, config: &BackpressureConfig) -> bool {
    buffered_bytes as f64 >= config.max_buffered_bytes as f64 * config.high_water_mark
}
