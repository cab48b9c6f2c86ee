//! Lua sources of the compound store operations.
//!
//! Every script returns a flat array of integers except [`ADMIT`], whose last element is the
//! cached metadata JSON (or an empty string). Scripts that read keys built from prefixes inside
//! the script require a single Redis node; Redis Cluster is not supported.

/// KEYS[1] lock key, ARGV[1] expected token. Returns 1 when deleted.
pub(crate) const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] counter, ARGV limit, units, window ms. Returns {allowed, current, retry_after_ms}.
pub(crate) const WINDOW_ALLOW: &str = r#"
local limit = tonumber(ARGV[1])
local units = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current + units > limit then
  local ttl = redis.call('PTTL', KEYS[1])
  if ttl < 0 then ttl = window end
  return {0, current, ttl}
end
if units == 0 then
  return {1, current, 0}
end
local value = redis.call('INCRBY', KEYS[1], units)
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], window)
end
return {1, value, 0}
"#;

/// KEYS rule counters, ARGV[1] units then (limit, window ms) per key.
/// Returns {1, count...} or {0, index, current, retry_after_ms}.
pub(crate) const WINDOWS_ALLOW: &str = r#"
local units = tonumber(ARGV[1])
local counts = {1}
for i, key in ipairs(KEYS) do
  local limit = tonumber(ARGV[2 * i])
  local window = tonumber(ARGV[2 * i + 1])
  local current = tonumber(redis.call('GET', key) or '0')
  if current + units > limit then
    local ttl = redis.call('PTTL', key)
    if ttl < 0 then ttl = window end
    return {0, i - 1, current, ttl}
  end
  counts[i + 1] = current
end
if units == 0 then
  return counts
end
for i, key in ipairs(KEYS) do
  counts[i + 1] = redis.call('INCRBY', key, units)
  if redis.call('PTTL', key) < 0 then
    redis.call('PEXPIRE', key, tonumber(ARGV[2 * i + 1]))
  end
end
return counts
"#;

/// KEYS[1] counter, ARGV[1] units. Returns the new value; a missing key stays missing.
pub(crate) const COUNTER_DECR: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local value = tonumber(current) - tonumber(ARGV[1])
if value < 0 then value = 0 end
redis.call('SET', KEYS[1], value, 'KEEPTTL')
return value
"#;

/// KEYS[1] counter. Returns {present, current, pttl}.
pub(crate) const COUNTER_DETAIL: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {0, 0, -2}
end
return {1, tonumber(current), redis.call('PTTL', KEYS[1])}
"#;

/// KEYS[1] bucket hash, ARGV capacity, interval ms, requested.
/// Returns {allowed, remaining, wait_ms}. Refill uses the server clock.
pub(crate) const BUCKET_TAKE: &str = r#"
local capacity = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(state[1]) or capacity
local last = tonumber(state[2]) or now
local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * capacity / interval)
local allowed = 0
local wait = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
else
  wait = math.max(1, math.ceil((requested - tokens) * interval / capacity))
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'last', now)
redis.call('PEXPIRE', KEYS[1], interval)
return {allowed, math.floor(tokens), wait}
"#;

/// KEYS[1] pool hash, ARGV[1] ttl ms then (id, weight) pairs.
pub(crate) const POOL_REPLACE: &str = r#"
redis.call('DEL', KEYS[1])
if #ARGV < 3 then
  return 0
end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
"#;

/// KEYS[1] pool hash. ARGV meta prefix, daily prefix, rate prefix, requested id, preferred id,
/// units, daily ttl ms, rate window ms. Ids of 0 mean none.
///
/// Returns {code, id as string, n, meta}: 0 admitted, 1 pool missing, 2 metadata missing,
/// 3 daily quota exhausted, 4 rate limited (n is the wait in ms), 5 fewer daily units left than
/// requested (n is what is left).
pub(crate) const ADMIT: &str = r#"
local units = tonumber(ARGV[6])
local daily_ttl = tonumber(ARGV[7])
local rate_window = tonumber(ARGV[8])

local id = ARGV[4]
if id == '0' then
  local members = redis.call('HKEYS', KEYS[1])
  if #members == 0 then
    return {1, '0', 0, ''}
  end
  id = nil
  local lowest = nil
  for _, member in ipairs(members) do
    if member == ARGV[5] then
      id = member
      break
    end
    if lowest == nil or tonumber(member) < tonumber(lowest) then
      lowest = member
    end
  end
  id = id or lowest
end

local raw = redis.call('GET', ARGV[1] .. ':' .. id)
if not raw then
  return {2, id, 0, ''}
end
local meta = cjson.decode(raw)

local daily_key = ARGV[2] .. ':' .. id
local daily = tonumber(redis.call('GET', daily_key) or '0')
local daily_limit = tonumber(meta.daily_limit)
if daily + units > daily_limit then
  if daily >= daily_limit then
    return {3, id, 0, ''}
  end
  return {5, id, daily_limit - daily, ''}
end

local rate_key = ARGV[3] .. ':' .. id
local rate = tonumber(redis.call('GET', rate_key) or '0')
if rate + units > tonumber(meta.per_second_limit) then
  local ttl = redis.call('PTTL', rate_key)
  if ttl < 0 then ttl = rate_window end
  return {4, id, ttl, ''}
end

redis.call('INCRBY', daily_key, units)
if redis.call('PTTL', daily_key) < 0 then
  redis.call('PEXPIRE', daily_key, daily_ttl)
end
redis.call('INCRBY', rate_key, units)
if redis.call('PTTL', rate_key) < 0 then
  redis.call('PEXPIRE', rate_key, rate_window)
end
return {0, id, 0, raw}
"#;
