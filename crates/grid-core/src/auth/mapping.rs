//! Issuer-specific role derivation.
//!
//! How an identity provider encodes "this person is an admin" differs per provider (an email
//! domain, a realm role, a group name). Each issuer gets a [`RoleMapper`]; the built-in
//! [`RuleMapper`] evaluates configured [`RoleRule`]s in order and the first match wins.

use super::TokenClaims;
use crate::role::Role;
use serde::Deserialize;
use serde_json::Value;

/// Role assigned when no mapping rule fires: the lowest-privilege non-anonymous role.
pub const DEFAULT_ROLE: Role = Role::Viewer;

pub trait RoleMapper: Send + Sync {
    /// Map verified claims to a role, or `None` when no rule applies.
    fn map_role(&self, claims: &TokenClaims) -> Option<Role>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleRule {
    /// Email address ends with `@<domain>` (case-insensitive).
    EmailDomain { domain: String, role: Role },

    /// Claim at a dotted path is a string containing `marker`, or an array with an element that
    /// contains it (e.g. `realm_access.roles`, `groups`).
    ClaimContains {
        claim: String,
        marker: String,
        role: Role,
    },

    /// Exact subject match, for service accounts.
    Subject { subject: String, role: Role },
}

impl RoleRule {
    pub fn role(&self) -> Role {
        match self {
            RoleRule::EmailDomain { role, .. }
            | RoleRule::ClaimContains { role, .. }
            | RoleRule::Subject { role, .. } => *role,
        }
    }

    fn matches(&self, claims: &TokenClaims) -> bool {
        match self {
            RoleRule::EmailDomain { domain, .. } => {
                if claims.extra.get("email_verified") == Some(&Value::Bool(false)) {
                    return false;
                }
                let Some(email) = claims.email.as_deref() else {
                    return false;
                };
                let suffix = format!("@{}", domain.trim_start_matches('@'));
                email
                    .to_ascii_lowercase()
                    .ends_with(&suffix.to_ascii_lowercase())
            }
            RoleRule::ClaimContains { claim, marker, .. } => {
                claim_at_path(claims, claim).is_some_and(|v| value_contains(v, marker))
            }
            RoleRule::Subject { subject, .. } => claims.sub == *subject,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleMapper {
    rules: Vec<RoleRule>,
}

impl RuleMapper {
    pub fn new(rules: Vec<RoleRule>) -> crate::Result<Self> {
        if let Some(rule) = rules.iter().find(|r| r.role() == Role::Anonymous) {
            return Err(crate::Error::msg(format!(
                "role mapping rule may not grant ANONYMOUS: {rule:?}"
            )));
        }
        Ok(Self { rules })
    }
}

impl RoleMapper for RuleMapper {
    fn map_role(&self, claims: &TokenClaims) -> Option<Role> {
        self.rules
            .iter()
            .find(|rule| rule.matches(claims))
            .map(RoleRule::role)
    }
}

/// Apply a mapper with the safe default. Never yields `Anonymous` for a verified token.
pub fn derive_role(mapper: &dyn RoleMapper, claims: &TokenClaims) -> Role {
    match mapper.map_role(claims) {
        Some(Role::Anonymous) | None => DEFAULT_ROLE,
        Some(role) => role,
    }
}

fn claim_at_path<'a>(claims: &'a TokenClaims, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = claims.extra.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_contains(value: &Value, marker: &str) -> bool {
    match value {
        Value::String(s) => s.contains(marker),
        Value::Array(items) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|s| s.contains(marker))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> TokenClaims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn email_domain_rule_is_case_insensitive() {
        let mapper = RuleMapper::new(vec![RoleRule::EmailDomain {
            domain: "lab.example.org".into(),
            role: Role::Scientist,
        }])
        .unwrap();
        let c = claims(json!({ "sub": "u1", "email": "Ada@LAB.example.org" }));
        assert_eq!(derive_role(&mapper, &c), Role::Scientist);

        let other = claims(json!({ "sub": "u2", "email": "eve@evil-lab.example.org.attacker" }));
        assert_eq!(derive_role(&mapper, &other), DEFAULT_ROLE);
    }

    #[test]
    fn unverified_email_does_not_map() {
        let mapper = RuleMapper::new(vec![RoleRule::EmailDomain {
            domain: "lab.example.org".into(),
            role: Role::Admin,
        }])
        .unwrap();
        let c = claims(json!({
            "sub": "u1",
            "email": "ada@lab.example.org",
            "email_verified": false
        }));
        assert_eq!(derive_role(&mapper, &c), DEFAULT_ROLE);
    }

    #[test]
    fn nested_claim_marker_matches_array_elements() {
        let mapper = RuleMapper::new(vec![
            RoleRule::ClaimContains {
                claim: "realm_access.roles".into(),
                marker: "grid-admin".into(),
                role: Role::Admin,
            },
            RoleRule::ClaimContains {
                claim: "groups".into(),
                marker: "scientists".into(),
                role: Role::Scientist,
            },
        ])
        .unwrap();

        let admin = claims(json!({
            "sub": "u1",
            "realm_access": { "roles": ["offline_access", "grid-admin"] }
        }));
        assert_eq!(derive_role(&mapper, &admin), Role::Admin);

        let sci = claims(json!({ "sub": "u2", "groups": "/org/scientists" }));
        assert_eq!(derive_role(&mapper, &sci), Role::Scientist);

        let nobody = claims(json!({ "sub": "u3", "realm_access": { "roles": "oops" } }));
        assert_eq!(derive_role(&mapper, &nobody), DEFAULT_ROLE);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mapper = RuleMapper::new(vec![
            RoleRule::Subject {
                subject: "svc-worker".into(),
                role: Role::Worker,
            },
            RoleRule::EmailDomain {
                domain: "example.org".into(),
                role: Role::Admin,
            },
        ])
        .unwrap();
        let c = claims(json!({ "sub": "svc-worker", "email": "svc@example.org" }));
        assert_eq!(derive_role(&mapper, &c), Role::Worker);
    }

    #[test]
    fn anonymous_rules_are_rejected() {
        let err = RuleMapper::new(vec![RoleRule::Subject {
            subject: "x".into(),
            role: Role::Anonymous,
        }])
        .unwrap_err();
        assert!(err.to_string().contains("ANONYMOUS"));
    }
}
