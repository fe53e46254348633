/**
 * AUTHENTIFICATION - Identité de l'appelant via token ou cookie `auth_token`.
 * Les tokens sont émis ailleurs ; ce module les compare aux fiches utilisateurs.
 */

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::Identity;
use crate::store::{ObjectKind, ObjectStore, Record};

pub struct Authenticator {
    store: Arc<dyn ObjectStore>,
}

fn is_admin(record: &Record) -> bool {
    match record.get("admin") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

/// `Authorization: token <t>` / `Bearer <t>`, else the `auth_token` cookie
pub fn request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let mut parts = value.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default().trim();
        if (scheme.eq_ignore_ascii_case("token") || scheme.eq_ignore_ascii_case("bearer"))
            && !token.is_empty()
        {
            return Some(token.to_string());
        }
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == "auth_token" && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

impl Authenticator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn identify(&self, headers: &HeaderMap) -> Identity {
        match request_token(headers) {
            Some(token) => self.identify_token(&token),
            None => Identity::Anonymous,
        }
    }

    /// Linear scan over user records for a matching `auth_token`
    pub fn identify_token(&self, token: &str) -> Identity {
        let names = match self.store.list(ObjectKind::User) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "could not list user records");
                return Identity::Anonymous;
            }
        };
        for name in names {
            let record = match self.store.get(ObjectKind::User, &name) {
                Ok(r) => r,
                Err(e) => {
                    warn!(user = %name, error = %e, "unreadable user record");
                    continue;
                }
            };
            if record.get_str("auth_token") == Some(token) {
                let user = record.name().to_string();
                debug!(user = %user, "request authenticated");
                return Identity::User {
                    admin: is_admin(&record),
                    name: user,
                };
            }
        }
        debug!("unknown auth token");
        Identity::Anonymous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;

    fn authenticator() -> Authenticator {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            ObjectKind::User,
            Record::new("alice").with("auth_token", "tok-alice"),
        );
        store.seed(
            ObjectKind::User,
            Record::new("root")
                .with("auth_token", "tok-root")
                .with("admin", "true"),
        );
        store.seed(ObjectKind::User, Record::new("ghost"));
        Authenticator::new(store)
    }

    #[test]
    fn header_schemes() {
        let auth = authenticator();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("token tok-alice"));
        assert_eq!(auth.identify(&headers), Identity::user("alice"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-root"));
        assert_eq!(auth.identify(&headers), Identity::admin("root"));
    }

    #[test]
    fn cookie_fallback() {
        let auth = authenticator();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; auth_token=tok-alice"));
        assert_eq!(auth.identify(&headers), Identity::user("alice"));
    }

    #[test]
    fn unknown_or_missing_tokens_are_anonymous() {
        let auth = authenticator();
        let mut headers = HeaderMap::new();
        assert_eq!(auth.identify(&headers), Identity::Anonymous);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("token nope"));
        assert_eq!(auth.identify(&headers), Identity::Anonymous);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(auth.identify(&headers), Identity::Anonymous);
    }
}
