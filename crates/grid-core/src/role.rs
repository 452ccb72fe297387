use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal role derived from an identity token.
///
/// Roles are not ranked. What a role may do is answered only by the capability predicates
/// (`can_submit`, `can_manage_workers`, `can_view`); `Anonymous` satisfies none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Scientist,
    Worker,
    Viewer,
    Anonymous,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Scientist,
        Role::Worker,
        Role::Viewer,
        Role::Anonymous,
    ];

    pub fn can_submit(self) -> bool {
        matches!(self, Role::Admin | Role::Scientist)
    }

    pub fn can_manage_workers(self) -> bool {
        matches!(self, Role::Admin | Role::Worker)
    }

    pub fn can_view(self) -> bool {
        matches!(
            self,
            Role::Admin | Role::Scientist | Role::Worker | Role::Viewer
        )
    }

    pub fn has(self, capability: Capability) -> bool {
        match capability {
            Capability::Submit => self.can_submit(),
            Capability::ManageWorkers => self.can_manage_workers(),
            Capability::View => self.can_view(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Scientist => "SCIENTIST",
            Role::Worker => "WORKER",
            Role::Viewer => "VIEWER",
            Role::Anonymous => "ANONYMOUS",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Submit,
    ManageWorkers,
    View,
}

impl Capability {
    /// Roles granting this capability, in declaration order.
    pub fn granted_to(self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|r| r.has(self)).collect()
    }
}

/// Authenticated identity for one in-flight call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub subject: String,
    pub email: Option<String>,
    pub issuer: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_no_capability() {
        for cap in [Capability::Submit, Capability::ManageWorkers, Capability::View] {
            assert!(!Role::Anonymous.has(cap), "anonymous must not have {cap:?}");
        }
    }

    #[test]
    fn submit_is_granted_to_admin_and_scientist() {
        assert_eq!(
            Capability::Submit.granted_to(),
            vec![Role::Admin, Role::Scientist]
        );
        assert_eq!(
            Capability::ManageWorkers.granted_to(),
            vec![Role::Admin, Role::Worker]
        );
        assert_eq!(Capability::View.granted_to().len(), 4);
    }

    #[test]
    fn serializes_screaming_case() {
        let v = serde_json::to_value(Role::Scientist).unwrap();
        assert_eq!(v, serde_json::json!("SCIENTIST"));
    }
}
