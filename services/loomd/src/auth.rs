// Token and certificate authorization rules.
//
// A rule maps a credential (bearer token value or client certificate CN) to
// a principal plus allow-lists of rooms and roles. Authorization runs once
// per stream, after the preface and before the core sees any frames.
use std::collections::HashMap;

use loom_wire::Role;

use crate::config::{AuthMode, AuthSection};

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub principal: String,
    pub reason: &'static str,
}

impl Decision {
    fn allow(principal: impl Into<String>) -> Self {
        Self {
            allowed: true,
            principal: principal.into(),
            reason: "",
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            allowed: false,
            principal: String::new(),
            reason,
        }
    }

    fn deny_as(principal: impl Into<String>, reason: &'static str) -> Self {
        Self {
            allowed: false,
            principal: principal.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    principal: String,
    rooms: Vec<String>,
    roles: Vec<Role>,
}

/// Resolves (credential, room, role) triples to allow/deny decisions.
pub struct Authorizer {
    mode: AuthMode,
    tokens_by_value: HashMap<String, Rule>,
    certs_by_principal: HashMap<String, Rule>,
}

impl Authorizer {
    pub fn from_config(auth: &AuthSection) -> Self {
        let mut tokens_by_value = HashMap::with_capacity(auth.tokens.len());
        for rule in &auth.tokens {
            tokens_by_value.insert(
                rule.token.clone(),
                Rule {
                    principal: rule.principal.clone(),
                    rooms: rule.rooms.clone(),
                    roles: parse_roles(&rule.roles),
                },
            );
        }
        let mut certs_by_principal = HashMap::with_capacity(auth.certs.len());
        for rule in &auth.certs {
            certs_by_principal.insert(
                rule.principal.clone(),
                Rule {
                    principal: rule.principal.clone(),
                    rooms: rule.rooms.clone(),
                    roles: parse_roles(&rule.roles),
                },
            );
        }
        Self {
            mode: auth.mode,
            tokens_by_value,
            certs_by_principal,
        }
    }

    pub fn authorize(
        &self,
        token: &str,
        peer_cert_der: Option<&[u8]>,
        room: &str,
        role: Role,
    ) -> Decision {
        match self.mode {
            AuthMode::Disabled => Decision::allow("anonymous"),
            AuthMode::Token => self.authorize_token(token, room, role),
            AuthMode::Mtls => self.authorize_cert(peer_cert_der, room, role),
            AuthMode::Both => {
                let token_decision = self.authorize_token(token, room, role);
                if !token_decision.allowed {
                    return token_decision;
                }
                let cert_decision = self.authorize_cert(peer_cert_der, room, role);
                if !cert_decision.allowed {
                    // Keep the token principal so logs name who failed.
                    return Decision::deny_as(token_decision.principal, cert_decision.reason);
                }
                token_decision
            }
        }
    }

    fn authorize_token(&self, token: &str, room: &str, role: Role) -> Decision {
        if token.is_empty() {
            return Decision::deny("missing token");
        }
        let Some(rule) = self.tokens_by_value.get(token) else {
            return Decision::deny("invalid token");
        };
        self.check_rule(rule, room, role)
    }

    fn authorize_cert(&self, peer_cert_der: Option<&[u8]>, room: &str, role: Role) -> Decision {
        let Some(der) = peer_cert_der else {
            return Decision::deny("missing peer certificate");
        };
        let Some(principal) = principal_from_cert(der) else {
            return Decision::deny("missing certificate CN");
        };
        let Some(rule) = self.certs_by_principal.get(&principal) else {
            return Decision::deny_as(principal, "unknown principal");
        };
        self.check_rule(rule, room, role)
    }

    fn check_rule(&self, rule: &Rule, room: &str, role: Role) -> Decision {
        if !rule.roles.contains(&role) {
            return Decision::deny_as(rule.principal.clone(), "role not allowed");
        }
        if !rule
            .rooms
            .iter()
            .any(|allowed| allowed == "*" || allowed == room)
        {
            return Decision::deny_as(rule.principal.clone(), "room not allowed");
        }
        Decision::allow(rule.principal.clone())
    }
}

// Config spells roles as "produce"/"consume".
fn parse_roles(roles: &[String]) -> Vec<Role> {
    roles
        .iter()
        .filter_map(|role| match role.to_ascii_lowercase().as_str() {
            "produce" => Some(Role::Producer),
            "consume" => Some(Role::Consumer),
            _ => None,
        })
        .collect()
}

fn principal_from_cert(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let result = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string());
    result
}
