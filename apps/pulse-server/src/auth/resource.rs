use serde_json::Value;

/// Resource used when an operation names no primary target.
pub const WILDCARD: &str = "*";

/// Request fields naming the primary target of an operation, per namespace,
/// in priority order.
fn target_fields(namespace: &str) -> &'static [&'static str] {
    match namespace {
        "store" => &["bucket", "query"],
        "rules" => &["topic", "pattern", "key"],
        "procedures" => &["name"],
        _ => &["resource"],
    }
}

/// The primary target of a request (bucket, topic, pattern, ...), if present.
pub fn primary_target<'a>(namespace: &str, request: &'a Value) -> Option<&'a str> {
    target_fields(namespace)
        .iter()
        .find_map(|field| request.get(*field).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Resource string handed to the permission policy.
pub fn resource_for(namespace: &str, request: &Value) -> String {
    primary_target(namespace, request)
        .unwrap_or(WILDCARD)
        .to_string()
}
