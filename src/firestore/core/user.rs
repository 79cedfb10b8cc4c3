use std::fmt::{Display, Formatter};

/// Identity that owns a set of pending writes. Each user gets its own
/// mutation queue and overlay namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Segment used to namespace persisted per-user state.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(anonymous)"),
        }
    }
}
