use std::fmt;

/// Opaque identity used to partition rate limit budgets.
///
/// Authenticated callers are keyed as `user:<id>`, anonymous ones as
/// `ip:<address>`. Limiters never look inside the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey(String);

impl CallerKey {
    pub fn user(id: impl fmt::Display) -> Self {
        Self(format!("user:{id}"))
    }

    pub fn ip(addr: impl fmt::Display) -> Self {
        Self(format!("ip:{addr}"))
    }

    /// Prefer the authenticated identity, fall back to the network origin.
    pub fn resolve(user_id: Option<&str>, remote_addr: Option<&str>) -> Self {
        match user_id {
            Some(id) if !id.is_empty() => Self::user(id),
            _ => Self::ip(remote_addr.unwrap_or("unknown")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for CallerKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CallerKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl AsRef<str> for CallerKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
