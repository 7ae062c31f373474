use serde::{Deserialize, Serialize};
use serde_with::{OneOrMany, serde_as};

/// Principals with reserved semantics in the evaluation rules.
pub const ADMIN_USER: &str = "admin";
pub const ANONYMOUS_USER: &str = "anonymous";

/// The built-in policy that short-circuits evaluation for `admin`.
pub const ADMINISTRATOR_ACCESS: &str = "AdministratorAccess";

const ARN_PREFIX: &str = "arn:aws:s3:::";

/// IAM-style policy document.
///
/// ```json
/// { "name": "read-public", "version": "2012-10-17", "statement": [
///     { "effect": "Allow", "action": ["s3:GetObject"], "resource": ["arn:aws:s3:::public/*"] }
/// ]}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub statement: Vec<Statement>,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub effect: Effect,
    #[serde_as(as = "OneOrMany<_>")]
    #[serde(default)]
    pub action: Vec<String>,
    #[serde_as(as = "OneOrMany<_>")]
    #[serde(default)]
    pub resource: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// An explicit Deny statement matched.
    ExplicitDeny,
    /// Nothing allowed the request.
    DefaultDeny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::ExplicitDeny => "policy deny",
            Decision::DefaultDeny => "no-matching-allow",
        }
    }
}

pub fn bucket_arn(bucket: &str) -> String {
    format!("{ARN_PREFIX}{bucket}")
}

pub fn object_arn(bucket: &str, key: &str) -> String {
    format!("{ARN_PREFIX}{bucket}/{key}")
}

/// Case-insensitive, `*` matches everything, a trailing `*` matches a prefix.
fn action_matches(pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern = pattern.to_ascii_lowercase();
    let action = action.to_ascii_lowercase();
    match pattern.strip_suffix('*') {
        Some(prefix) => action.starts_with(prefix),
        None => pattern == action,
    }
}

/// ARN comparison with a trailing `*` wildcard, case-sensitive like AWS.
fn resource_matches(pattern: &str, resource: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => pattern == resource,
    }
}

fn statement_matches(statement: &Statement, action: &str, resource: &str) -> bool {
    statement.action.iter().any(|a| action_matches(a, action))
        && statement.resource.iter().any(|r| resource_matches(r, resource))
}

/// Evaluates the collected policy documents for one (action, resource) pair.
///
/// `admin` holding the built-in [`ADMINISTRATOR_ACCESS`] document is allowed
/// outright; otherwise an explicit Deny beats any Allow, and no match at all
/// denies by default.
pub fn evaluate(
    principal: &str,
    documents: &[PolicyDocument],
    action: &str,
    resource: &str,
) -> Decision {
    if principal == ADMIN_USER
        && documents.iter().any(|d| d.name == ADMINISTRATOR_ACCESS)
    {
        return Decision::Allow;
    }

    let mut allowed = false;
    for statement in documents.iter().flat_map(|d| &d.statement) {
        if !statement_matches(statement, action, resource) {
            continue;
        }
        match statement.effect {
            Effect::Deny => return Decision::ExplicitDeny,
            Effect::Allow => allowed = true,
        }
    }

    if allowed {
        Decision::Allow
    } else {
        Decision::DefaultDeny
    }
}
