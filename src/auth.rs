use thiserror::Error;

use crate::config::Auth;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or invalid token")]
    Unauthenticated,
    #[error("domain {0:?} is not allowed")]
    ForbiddenDomain(Option<String>),
}

/// Credentials supplied by the caller of a pipeline operation.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: String,
    pub domain: Option<String>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, domain: Option<String>) -> Self {
        Self {
            token: token.into(),
            domain,
        }
    }
}

/// Token + domain allow-list check run before any pipeline state is touched.
#[derive(Debug, Clone)]
pub struct AuthGate {
    token: String,
    allowed_domains: Vec<String>,
}

impl AuthGate {
    pub fn new(token: String, allowed_domains: Vec<String>) -> Self {
        let allowed_domains = allowed_domains
            .into_iter()
            .map(|d| normalize_domain(&d))
            .collect();
        Self {
            token,
            allowed_domains,
        }
    }

    pub fn from_config(cfg: &Auth) -> Self {
        Self::new(cfg.token.clone(), cfg.allowed_domains.clone())
    }

    pub fn check(&self, creds: &Credentials) -> Result<(), AuthError> {
        if creds.token.is_empty() || creds.token != self.token {
            return Err(AuthError::Unauthenticated);
        }
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let domain = creds
            .domain
            .as_deref()
            .map(normalize_domain)
            .filter(|d| !d.is_empty());
        match domain {
            Some(d) if self.allowed_domains.contains(&d) => Ok(()),
            _ => Err(AuthError::ForbiddenDomain(creds.domain.clone())),
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    let d = domain.trim();
    let d = d
        .strip_prefix("https://")
        .or_else(|| d.strip_prefix("http://"))
        .unwrap_or(d);
    d.trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(domains: &[&str]) -> AuthGate {
        AuthGate::new(
            "secret".into(),
            domains.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn wrong_token_is_unauthenticated() {
        let g = gate(&[]);
        assert_eq!(
            g.check(&Credentials::new("nope", None)),
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(
            g.check(&Credentials::new("", None)),
            Err(AuthError::Unauthenticated)
        );
        assert!(g.check(&Credentials::new("secret", None)).is_ok());
    }

    #[test]
    fn domain_checked_only_when_list_non_empty() {
        let g = gate(&["portal.example.com"]);
        assert!(g
            .check(&Credentials::new("secret", Some("https://Portal.example.com/".into())))
            .is_ok());
        assert_eq!(
            g.check(&Credentials::new("secret", Some("evil.example.com".into()))),
            Err(AuthError::ForbiddenDomain(Some("evil.example.com".into())))
        );
        assert_eq!(
            g.check(&Credentials::new("secret", None)),
            Err(AuthError::ForbiddenDomain(None))
        );
    }

    #[test]
    fn token_checked_before_domain() {
        let g = gate(&["portal.example.com"]);
        assert_eq!(
            g.check(&Credentials::new("bad", Some("evil.example.com".into()))),
            Err(AuthError::Unauthenticated)
        );
    }
}
