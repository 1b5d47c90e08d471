//! Explicit actor attribution for audit metadata.

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Who performed a mutation.
///
/// Every mutating operation takes an actor explicitly; there is no ambient
/// "current user". Background reactions (e.g. compensation) act as a named
/// system component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    User { user_id: UserId },
    System { component: String },
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self::User { user_id }
    }

    pub fn system(component: impl Into<String>) -> Self {
        Self::System {
            component: component.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System { .. })
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Actor::User { user_id } => write!(f, "user:{user_id}"),
            Actor::System { component } => write!(f, "system:{component}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_distinguishes_users_and_system() {
        let user = UserId::new();
        assert_eq!(Actor::user(user).to_string(), format!("user:{user}"));
        assert_eq!(Actor::system("sweeper").to_string(), "system:sweeper");
        assert!(Actor::system("sweeper").is_system());
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(Actor::system("inventory-saga")).unwrap();
        assert_eq!(json["kind"], "system");
        assert_eq!(json["component"], "inventory-saga");
    }
}
