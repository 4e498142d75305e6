use redis::Script;

/// `KEYS[1]` = lock key, `ARGV[1]` = expected owner token.
/// Returns 1 if the key was deleted, 0 otherwise.
const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// `KEYS[1]` = lock key, `ARGV[1]` = expected owner token, `ARGV[2]` = TTL in ms.
/// Returns 1 if the expiry was reset, 0 otherwise.
const COMPARE_AND_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub(crate) fn compare_and_delete() -> Script {
    Script::new(COMPARE_AND_DELETE)
}

pub(crate) fn compare_and_extend() -> Script {
    Script::new(COMPARE_AND_EXTEND)
}
