//! Connection candidates
//!
//! The tenant configuration document lists one backend URL and any number of
//! client credentials. Each credential becomes one connection candidate, tried
//! in document order by the gateway.
//!
//! ```json
//! { "backendUrl": "https://org.crm4.dynamics.com",
//!   "users": [ { "clientId": "...", "clientSecret": "..." } ] }
//! ```
//!
//! The older spelling (`CrmUrl`, `Users`, `CrmClientId`, `CrmClientSecret`) is
//! accepted too.

use std::fmt;
use log::{debug, warn};
use reqwest::Url;
use serde::Deserialize;

/// Credential used for one connection attempt
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth client credentials of an application user
    ClientSecret {
        /// Application (client) id
        client_id: String,
        /// Client secret
        client_secret: String,
    },
    /// No explicit credential; the request is sent as-is and authentication is
    /// left to the environment
    Implicit,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ClientSecret { client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("client_secret", &"***")
                .finish(),
            Credential::Implicit => write!(f, "Implicit"),
        }
    }
}

/// One credential + endpoint pair eligible for a backend session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCandidate {
    /// Position in the tenant document
    pub index: usize,
    /// Backend base URL
    pub endpoint: Url,
    /// Credential to authenticate with
    pub credential: Credential,
}

impl ConnectionCandidate {
    /// Client id for logs, if any
    pub fn identifier(&self) -> &str {
        match &self.credential {
            Credential::ClientSecret { client_id, .. } => client_id,
            Credential::Implicit => "implicit",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantDocument {
    #[serde(alias = "CrmUrl", alias = "crmUrl", alias = "BackendUrl")]
    backend_url: String,
    #[serde(default, alias = "Users")]
    users: Option<Vec<UserEntry>>,
    #[serde(default, alias = "CrmClientId", alias = "ClientId")]
    client_id: Option<String>,
    #[serde(default, alias = "CrmClientSecret", alias = "ClientSecret")]
    client_secret: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    #[serde(alias = "CrmClientId", alias = "ClientId")]
    client_id: String,
    #[serde(alias = "CrmClientSecret", alias = "ClientSecret")]
    client_secret: String,
}

/// Resolve the ordered connection candidates of a tenant document.
///
/// Never fails: an absent or malformed document yields no candidates, which
/// callers treat as "no connection possible". A document without a `users`
/// list yields exactly one candidate for the default credential.
pub fn resolve_candidates(document: Option<&str>) -> Vec<ConnectionCandidate> {
    let Some(text) = document.filter(|text| !text.trim().is_empty()) else {
        warn!("No tenant connection document configured; no connection candidates");
        return Vec::new();
    };

    let parsed: TenantDocument = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Tenant connection document is malformed ({}); no connection candidates", e);
            return Vec::new();
        }
    };

    let endpoint = match Url::parse(parsed.backend_url.trim().trim_end_matches('/')) {
        Ok(url) if url.has_host() => url,
        Ok(_) | Err(_) => {
            warn!("Tenant connection document has an invalid backend URL; no connection candidates");
            return Vec::new();
        }
    };

    let candidates: Vec<ConnectionCandidate> = match parsed.users {
        Some(users) => users
            .into_iter()
            .enumerate()
            .map(|(index, user)| ConnectionCandidate {
                index,
                endpoint: endpoint.clone(),
                credential: Credential::ClientSecret {
                    client_id: user.client_id,
                    client_secret: user.client_secret,
                },
            })
            .collect(),
        None => {
            let credential = match (parsed.client_id, parsed.client_secret) {
                (Some(client_id), Some(client_secret)) => Credential::ClientSecret { client_id, client_secret },
                _ => Credential::Implicit,
            };
            vec![ConnectionCandidate { index: 0, endpoint, credential }]
        }
    };

    debug!("Resolved {} connection candidate(s)", candidates.len());
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_in_order() {
        let document = r#"{
            "backendUrl": "https://org.crm4.dynamics.com/",
            "users": [
                {"clientId": "app-1", "clientSecret": "s1"},
                {"clientId": "app-2", "clientSecret": "s2"}
            ]
        }"#;

        let candidates = resolve_candidates(Some(document));

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].index, 0);
        assert_eq!(candidates[0].identifier(), "app-1");
        assert_eq!(candidates[1].identifier(), "app-2");
        assert_eq!(candidates[0].endpoint, candidates[1].endpoint);
        assert_eq!(candidates[0].endpoint.as_str(), "https://org.crm4.dynamics.com/");
    }

    #[test]
    fn test_legacy_spelling() {
        let document = r#"{
            "CrmUrl": "https://legacy.crm.dynamics.com",
            "Users": [{"CrmClientId": "old-app", "CrmClientSecret": "secret"}]
        }"#;

        let candidates = resolve_candidates(Some(document));

        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].credential,
            Credential::ClientSecret { client_id: "old-app".into(), client_secret: "secret".into() }
        );
    }

    #[test]
    fn test_no_users_yields_one_default_candidate() {
        let candidates = resolve_candidates(Some(r#"{"backendUrl": "https://org.crm.dynamics.com"}"#));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].credential, Credential::Implicit);

        let candidates = resolve_candidates(Some(
            r#"{"backendUrl": "https://org.crm.dynamics.com", "clientId": "app", "clientSecret": "s"}"#,
        ));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].identifier(), "app");
    }

    #[test]
    fn test_zero_candidates() {
        assert!(resolve_candidates(None).is_empty());
        assert!(resolve_candidates(Some("")).is_empty());
        assert!(resolve_candidates(Some("Url=https://org.crm.dynamics.com;AuthType=ClientSecret")).is_empty());
        assert!(resolve_candidates(Some(r#"{"users": []}"#)).is_empty());
        assert!(resolve_candidates(Some(r#"{"backendUrl": "not a url"}"#)).is_empty());
        assert!(resolve_candidates(Some(r#"{"backendUrl": "https://org.crm.dynamics.com", "users": []}"#)).is_empty());
    }

    #[test]
    fn test_secret_is_not_debug_printed() {
        let candidates = resolve_candidates(Some(
            r#"{"backendUrl": "https://org.crm.dynamics.com", "users": [{"clientId": "app", "clientSecret": "hunter2"}]}"#,
        ));
        let printed = format!("{:?}", candidates);
        assert!(printed.contains("app"));
        assert!(!printed.contains("hunter2"));
    }
}
