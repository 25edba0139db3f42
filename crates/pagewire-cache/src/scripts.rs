//! Server-side scripts for the operations that must not interleave.

/// KEYS[1] lock key, ARGV[1] owner secret, ARGV[2] ttl seconds.
pub(crate) const LOCK: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

/// KEYS[1] lock key, ARGV[1] owner secret. Returns 0 when someone else owns it.
pub(crate) const UNLOCK: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    return 1
end
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// KEYS[1] session hash, KEYS[2] controls hash,
/// ARGV[1] max size, ARGV[2] control id, ARGV[3] control json.
pub(crate) const SET_SESSION_CONTROL: &str = r#"
local size = tonumber(redis.call('HGET', KEYS[1], 'size') or '0')
local current = redis.call('HGET', KEYS[2], ARGV[2])
if current then
    size = size - string.len(current)
end
size = size + string.len(ARGV[3])
local limit = tonumber(ARGV[1])
if limit > 0 and size > limit then
    return 0
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
redis.call('HSET', KEYS[1], 'size', size)
return 1
"#;

/// KEYS[1] session hash, KEYS[2] controls hash, ARGV[1] control id.
pub(crate) const REMOVE_SESSION_CONTROL: &str = r#"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current then
    redis.call('HDEL', KEYS[2], ARGV[1])
    redis.call('HINCRBY', KEYS[1], 'size', -string.len(current))
end
return 1
"#;
