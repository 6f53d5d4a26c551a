//! Shared guardrails for traversal limits and numeric settings.

// Tracing guards
pub const MAX_TRACE_DEPTH: i64 = 1024;
pub const MAX_TRACES_PER_FILE: i64 = 64;
pub const MAX_RESOLUTION_HOPS: usize = 16;
pub const MAX_INFERENCE_DEPTH: usize = 8;
pub const MAX_MRO_DEPTH: usize = 12;

// Mapping guards
pub const MAX_CONTEXT_WINDOW: i64 = 50;
pub const MAX_REASON_LINES: usize = 5;

// Import graph guards
pub const MAX_GRAPH_VISITED: usize = 20_000;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: i64, maximum: i64) -> usize {
    clamp_int(value, 1, maximum) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_int_bounds() {
        assert_eq!(clamp_int(-4, 0, 10), 0);
        assert_eq!(clamp_int(40, 0, 10), 10);
        assert_eq!(clamp_int(7, 0, 10), 7);
    }

    #[test]
    fn test_clamp_depth_never_zero() {
        assert_eq!(clamp_depth(0, MAX_TRACE_DEPTH), 1);
        assert_eq!(clamp_depth(i64::MAX, MAX_TRACE_DEPTH), MAX_TRACE_DEPTH as usize);
    }
}
