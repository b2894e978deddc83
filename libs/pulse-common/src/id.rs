use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = pulse_common::id::prefixed_ulid("sub");
/// assert!(id.starts_with("sub_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that represent a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const SUBSCRIPTION: &str = "sub";
    pub const CONNECTION: &str = "conn";
}

/// Subscription identifier handed to clients on `<ns>.subscribe`.
pub struct SubscriptionId;

impl PrefixedId for SubscriptionId {
    const PREFIX: &'static str = prefix::SUBSCRIPTION;
}
