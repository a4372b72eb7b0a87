use std::fmt;
use std::time::Duration;

/// Platform-assigned identifier of one inbound action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credential needed to answer one action: its id plus the platform token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub action_id: ActionId,
    pub secret: String,
}

impl Credential {
    pub fn new(action_id: ActionId, secret: impl Into<String>) -> Self {
        Self {
            action_id,
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("action_id", &self.action_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub const ROUTE_INTERACTION_CALLBACK: &str = "interaction_callback";
pub const ROUTE_FOLLOW_UP: &str = "follow_up";

/// Rate-limit domain: a route class scoped to its major resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub route: String,
    pub major: String,
}

impl BucketKey {
    pub fn new(route: impl Into<String>, major: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            major: major.into(),
        }
    }

    /// Bucket for the initial callback of one action.
    pub fn callback(action_id: &ActionId) -> Self {
        Self::new(ROUTE_INTERACTION_CALLBACK, action_id.as_str())
    }

    /// Bucket shared by every follow-up message of one action.
    pub fn follow_up(action_id: &ActionId) -> Self {
        Self::new(ROUTE_FOLLOW_UP, action_id.as_str())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.major)
    }
}

/// Rate-limit metadata reported by the platform alongside each response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketMetadata {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket_id: Option<String>,
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl BucketMetadata {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_after.is_none()
            && self.retry_after.is_none()
            && self.bucket_id.is_none()
            && !self.global
    }
}

/// Follow-up flavour: the single edit of the placeholder, or an extra message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryKind {
    Finalize,
    Append,
}

impl DeliveryKind {
    /// Finalize edits the deferred placeholder instead of posting a new message.
    pub fn is_edit(self) -> bool {
        matches!(self, DeliveryKind::Finalize)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryKind::Finalize => "finalize",
            DeliveryKind::Append => "append",
        }
    }
}

/// Ordering hint across tokens; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(100);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_keys_are_scoped_per_action() {
        let a = ActionId::from("a");
        let b = ActionId::from("b");

        assert_ne!(BucketKey::follow_up(&a), BucketKey::follow_up(&b));
        assert_ne!(BucketKey::follow_up(&a), BucketKey::callback(&a));
        assert_eq!(BucketKey::follow_up(&a).to_string(), "follow_up:a");
    }

    #[test]
    fn credential_debug_redacts_secret() {
        let credential = Credential::new(ActionId::from("a"), "super-secret");
        let rendered = format!("{credential:?}");

        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn only_finalize_edits() {
        assert!(DeliveryKind::Finalize.is_edit());
        assert!(!DeliveryKind::Append.is_edit());
    }
}
