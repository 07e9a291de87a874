//! Role/agent access evaluation.
//!
//! Two levels are checked in order: the owning server's policy, then the
//! capability's own policy. Each level is an any-match role check plus an
//! agent allowlist. An agent on the server allowlist bypasses everything.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Roles and trusted agents allowed to use a server or capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub required_roles: BTreeSet<String>,
    #[serde(default)]
    pub agent_allowlist: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn is_empty(&self) -> bool {
        self.required_roles.is_empty() && self.agent_allowlist.is_empty()
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent_allowlist.extend(agents.into_iter().map(Into::into));
        self
    }
}

/// Caller identity for a single request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub roles: BTreeSet<String>,
    pub agent_name: Option<String>,
}

impl SessionContext {
    pub fn new<I, S>(roles: I, agent_name: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            agent_name: agent_name.map(str::to_string),
        }
    }

    /// Parse a comma-separated role header value.
    pub fn from_header_values(roles: Option<&str>, agent_name: Option<&str>) -> Self {
        let roles = roles
            .map(|r| {
                r.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            roles,
            agent_name: agent_name
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    fn is_listed_in(&self, allowlist: &BTreeSet<String>) -> bool {
        self.agent_name
            .as_ref()
            .is_some_and(|agent| allowlist.contains(agent))
    }
}

/// Why a caller was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    MissingServerRole,
    AgentNotAllowedByServer,
    MissingCapabilityRole,
    AgentNotAllowedByCapability,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DenyReason::MissingServerRole => "caller has none of the server's required roles",
            DenyReason::AgentNotAllowedByServer => "agent is not on the server allowlist",
            DenyReason::MissingCapabilityRole => {
                "caller has none of the capability's required roles"
            }
            DenyReason::AgentNotAllowedByCapability => "agent is not on the capability allowlist",
        };
        f.write_str(msg)
    }
}

/// Outcome of access evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Granted by the server-level agent allowlist; item checks skipped.
    TrustedAgent,
    Allowed,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AccessDecision::Denied(_))
    }
}

enum LevelCheck {
    Bypass,
    Pass,
    MissingRole,
    AgentNotListed,
}

fn check_level(policy: &AccessPolicy, ctx: &SessionContext) -> LevelCheck {
    if ctx.is_listed_in(&policy.agent_allowlist) {
        return LevelCheck::Bypass;
    }
    if !policy.required_roles.is_empty() && policy.required_roles.is_disjoint(&ctx.roles) {
        return LevelCheck::MissingRole;
    }
    if !policy.agent_allowlist.is_empty() {
        return LevelCheck::AgentNotListed;
    }
    LevelCheck::Pass
}

/// Evaluate `ctx` against a capability's owning-server policy and its own policy.
pub fn evaluate(server: &AccessPolicy, item: &AccessPolicy, ctx: &SessionContext) -> AccessDecision {
    match check_level(server, ctx) {
        LevelCheck::Bypass => return AccessDecision::TrustedAgent,
        LevelCheck::MissingRole => return AccessDecision::Denied(DenyReason::MissingServerRole),
        LevelCheck::AgentNotListed => {
            return AccessDecision::Denied(DenyReason::AgentNotAllowedByServer);
        }
        LevelCheck::Pass => {}
    }

    match check_level(item, ctx) {
        LevelCheck::Bypass | LevelCheck::Pass => AccessDecision::Allowed,
        LevelCheck::MissingRole => AccessDecision::Denied(DenyReason::MissingCapabilityRole),
        LevelCheck::AgentNotListed => {
            AccessDecision::Denied(DenyReason::AgentNotAllowedByCapability)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(roles: &[&str], agent: Option<&str>) -> SessionContext {
        SessionContext::new(roles.iter().copied(), agent)
    }

    #[test]
    fn test_open_policies_allow_anyone() {
        let decision = evaluate(&AccessPolicy::default(), &AccessPolicy::default(), &ctx(&[], None));
        assert_eq!(decision, AccessDecision::Allowed);
    }

    #[test]
    fn test_server_allowlisted_agent_bypasses_roles() {
        let server = AccessPolicy::default()
            .with_roles(["admin"])
            .with_agents(["ops-bot"]);
        let item = AccessPolicy::default().with_roles(["root"]);
        let decision = evaluate(&server, &item, &ctx(&[], Some("ops-bot")));
        assert_eq!(decision, AccessDecision::TrustedAgent);
    }

    #[test]
    fn test_missing_server_role_denied() {
        let server = AccessPolicy::default().with_roles(["admin"]);
        let decision = evaluate(&server, &AccessPolicy::default(), &ctx(&["dev"], Some("x")));
        assert_eq!(decision, AccessDecision::Denied(DenyReason::MissingServerRole));
    }

    #[test]
    fn test_any_matching_role_passes() {
        let server = AccessPolicy::default().with_roles(["admin", "dev"]);
        let decision = evaluate(&server, &AccessPolicy::default(), &ctx(&["dev"], None));
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_server_allowlist_excludes_other_agents() {
        let server = AccessPolicy::default().with_agents(["ops-bot"]);
        let decision = evaluate(&server, &AccessPolicy::default(), &ctx(&["admin"], Some("other")));
        assert_eq!(
            decision,
            AccessDecision::Denied(DenyReason::AgentNotAllowedByServer)
        );
        let anonymous = evaluate(&server, &AccessPolicy::default(), &ctx(&["admin"], None));
        assert!(!anonymous.is_allowed());
    }

    #[test]
    fn test_item_level_role_denied_after_server_pass() {
        let server = AccessPolicy::default().with_roles(["dev"]);
        let item = AccessPolicy::default().with_roles(["admin"]);
        let decision = evaluate(&server, &item, &ctx(&["dev"], None));
        assert_eq!(
            decision,
            AccessDecision::Denied(DenyReason::MissingCapabilityRole)
        );
    }

    #[test]
    fn test_item_level_agent_bypass() {
        let item = AccessPolicy::default()
            .with_roles(["admin"])
            .with_agents(["deploy-bot"]);
        let decision = evaluate(&AccessPolicy::default(), &item, &ctx(&[], Some("deploy-bot")));
        assert_eq!(decision, AccessDecision::Allowed);
    }

    #[test]
    fn test_item_allowlist_excludes_other_agents() {
        let item = AccessPolicy::default().with_agents(["deploy-bot"]);
        let decision = evaluate(&AccessPolicy::default(), &item, &ctx(&[], Some("intruder")));
        assert_eq!(
            decision,
            AccessDecision::Denied(DenyReason::AgentNotAllowedByCapability)
        );
    }

    #[test]
    fn test_header_parsing() {
        let ctx = SessionContext::from_header_values(Some(" admin, dev ,,"), Some("  "));
        assert!(ctx.roles.contains("admin"));
        assert!(ctx.roles.contains("dev"));
        assert_eq!(ctx.roles.len(), 2);
        assert_eq!(ctx.agent_name, None);
    }
}
