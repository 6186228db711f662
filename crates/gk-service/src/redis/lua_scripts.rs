//! Lua script for the atomic sliding-window rate limiter.
//!
//! The four window operations (trim, record, count, bound storage) must be
//! indivisible from the perspective of any other caller touching the same
//! key; atomic Lua execution provides that without client-side locking.
//!
//! # Key Pattern
//!
//! - `rl:{scope}:{identifier}` - sorted set of event timestamps (ms),
//!   member values are `{timestamp}-{seq}` to keep concurrent same-ms
//!   events distinct.

/// Lua script for a sliding-window check.
///
/// Arguments:
/// - KEYS[1]: Window key (e.g., `rl:submit:198.51.100.7`)
/// - ARGV[1]: Current time in milliseconds
/// - ARGV[2]: Window length in milliseconds
/// - ARGV[3]: Unique member suffix for this event
///
/// Steps (atomic as a unit):
/// 1. Drop timestamps older than `now - window`
/// 2. Record the current event
/// 3. Count events remaining in the window
/// 4. Refresh the key's own expiry to the window length
///
/// Returns:
/// - The number of events inside the window, current event included
pub const SLIDING_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

if now == nil or window == nil then
    return redis.error_reply('invalid window arguments')
end

-- Trim events that fell out of the trailing window
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)

-- Record this event; member carries a unique suffix so concurrent
-- same-millisecond events are distinct set members
redis.call('ZADD', KEYS[1], now, ARGV[1] .. '-' .. ARGV[3])

local count = redis.call('ZCARD', KEYS[1])

-- Bound storage: the key dies one window after the last event
redis.call('PEXPIRE', KEYS[1], window)

return count
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_contains_all_window_steps() {
        // The four steps of the sliding-window contract, in order
        assert!(SLIDING_WINDOW.contains("ZREMRANGEBYSCORE"));
        assert!(SLIDING_WINDOW.contains("ZADD"));
        assert!(SLIDING_WINDOW.contains("ZCARD"));
        assert!(SLIDING_WINDOW.contains("PEXPIRE"));
    }

    #[test]
    fn test_script_trims_before_counting() {
        let trim = SLIDING_WINDOW
            .find("ZREMRANGEBYSCORE")
            .unwrap_or(usize::MAX);
        let count = SLIDING_WINDOW.find("ZCARD").unwrap_or(0);
        assert!(
            trim < count,
            "stale events must be trimmed before the count is taken"
        );
    }

    #[test]
    fn test_script_validates_arguments() {
        assert!(SLIDING_WINDOW.contains("if now == nil or window == nil then"));
        assert!(SLIDING_WINDOW.contains("error_reply"));
    }

    #[test]
    fn test_script_members_are_unique_per_event() {
        // Concurrent events in the same millisecond must not collapse into
        // one sorted-set member
        assert!(SLIDING_WINDOW.contains("ARGV[1] .. '-' .. ARGV[3]"));
    }

    #[test]
    fn test_script_length() {
        // Ensure the script is a reasonable size (not accidentally empty or huge)
        assert!(SLIDING_WINDOW.len() > 100);
        assert!(SLIDING_WINDOW.len() < 2000);
    }
}
