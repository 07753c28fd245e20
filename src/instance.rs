//! Backend instance: owns a backend's URL, HTTP client, cookie jar, and
//! auth/login state machine (spec §3, §4.1).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use chrono::Utc;
use bytes::Bytes;
use reqwest::header::{HeaderName, ACCEPT_ENCODING, COOKIE, HOST, ORIGIN, REFERER};
use tokio::sync::Mutex;
use url::Url;

use crate::config::BackendConfig;
use crate::error::{Error, Result};

/// A minimally-populated outbound request, retargeted at one backend.
///
/// Priming issues synthetic requests with only `method`/`path` set (spec
/// §4.9); `PrepareRequest` must accept those without panicking, so every
/// field here is either owned-and-defaulted or `Option`.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Build a synthetic GET request carrying only a path, as used by
    /// startup priming.
    pub fn synthetic(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// One backend torrent-client process.
pub struct BackendInstance {
    pub name: String,
    pub base_url: Url,
    pub auth_enabled: bool,
    username: Option<String>,
    password: Option<String>,
    cookie_timeout: Duration,
    client: reqwest::Client,
    /// Guards the login critical section; held across the network round
    /// trip, so it must be async-aware (spec §4.1 rationale).
    login_lock: Mutex<()>,
    /// Unix-epoch seconds after which the cached cookie is considered
    /// stale. `AtomicI64` so reads outside the login critical section (the
    /// `Login` fast path) never block.
    cookie_expiry_unix: AtomicI64,
}

impl BackendInstance {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("backend url {:?} does not parse: {e}", config.url)))?;

        if config.authenticate
            && (config.username.as_deref().unwrap_or("").is_empty()
                || config.password.as_deref().unwrap_or("").is_empty())
        {
            return Err(Error::Config(format!(
                "backend {:?} has authenticate=true but is missing credentials",
                config.url
            )));
        }

        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build backend client: {e}")))?;

        Ok(Self {
            name: config.name.clone().unwrap_or_else(|| base_url.to_string()),
            base_url,
            auth_enabled: config.authenticate,
            username: config.username.clone(),
            password: config.password.clone(),
            cookie_timeout: config.cookie_timeout(),
            client,
            login_lock: Mutex::new(()),
            cookie_expiry_unix: AtomicI64::new(0),
        })
    }

    /// Host string used for tie-breaks (Instance Registry §4.2) and debug output.
    pub fn host(&self) -> String {
        self.base_url
            .host_str()
            .map(|h| match self.base_url.port() {
                Some(p) => format!("{h}:{p}"),
                None => h.to_string(),
            })
            .unwrap_or_else(|| self.base_url.to_string())
    }

    fn cookie_valid(&self) -> bool {
        let expiry = self.cookie_expiry_unix.load(Ordering::Acquire);
        let now = now_unix();
        now < expiry
    }

    /// Forces the next `login()` call to re-authenticate, regardless of
    /// cached cookie state (`/debug/expirelogins`, spec §4.3 variant 2).
    pub fn expire_login(&self) {
        self.cookie_expiry_unix.store(0, Ordering::Release);
    }

    /// Idempotent, thread-safe login (spec §4.1). Returns immediately if
    /// auth is disabled or the cached cookie is still valid; at most one
    /// login is in flight at a time per instance.
    pub async fn login(&self) -> Result<()> {
        if !self.auth_enabled {
            return Ok(());
        }
        if self.cookie_valid() {
            return Ok(());
        }

        let _guard = self.login_lock.lock().await;

        // Re-check: another waiter may have refreshed the cookie while we
        // waited for the lock.
        if self.cookie_valid() {
            return Ok(());
        }

        let username = self.username.as_deref().unwrap_or_default();
        let password = self.password.as_deref().unwrap_or_default();

        let login_url = self
            .base_url
            .join("/api/v2/auth/login")
            .map_err(|e| Error::BackendAuth(format!("failed to build login url: {e}")))?;

        let resp = self
            .client
            .post(login_url)
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .map_err(|e| Error::BackendAuth(format!("{}: transport error: {e}", self.name)))?;

        let status = resp.status();
        if status.as_u16() != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendAuth(format!(
                "{}: login returned status {status}: {body}",
                self.name
            )));
        }

        let expiry = now_unix() + self.cookie_timeout.as_secs() as i64;
        self.cookie_expiry_unix.store(expiry, Ordering::Release);
        Ok(())
    }

    /// Retarget an inbound request at this backend: rewrite scheme/host,
    /// strip hop-by-hop and identifying headers, set `Referer` (spec §4.1).
    pub fn prepare_request(&self, req: &OutboundRequest) -> Result<reqwest::RequestBuilder> {
        let mut url = self.base_url.clone();
        url.set_path(&req.path);
        url.set_query(req.query.as_deref());

        let mut builder = self.client.request(req.method.clone(), url);

        for (name, value) in req.headers.iter() {
            if is_stripped_header(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder = builder
            .header(HOST, HeaderValue::from_str(&self.host()).unwrap_or_else(|_| HeaderValue::from_static("")))
            .header(REFERER, self.base_url.as_str());

        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }

        Ok(builder)
    }

    /// Perform the prepared request against this backend.
    pub async fn do_request(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        builder.send().await.map_err(Error::from)
    }
}

fn is_stripped_header(name: &HeaderName) -> bool {
    matches!(name, n if *n == ORIGIN || *n == COOKIE || *n == ACCEPT_ENCODING)
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str, authenticate: bool) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            authenticate,
            username: authenticate.then(|| "user".to_string()),
            password: authenticate.then(|| "pass".to_string()),
            name: None,
            cookie_timeout_secs: 900,
        }
    }

    #[test]
    fn rejects_unparseable_url() {
        let cfg = backend("not a url", false);
        let result = BackendInstance::from_config(&cfg);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_auth_enabled_without_credentials() {
        let mut cfg = backend("http://127.0.0.1:8080", true);
        cfg.username = None;
        let result = BackendInstance::from_config(&cfg);
        assert!(result.is_err());
    }

    #[test]
    fn host_includes_explicit_port() {
        let cfg = backend("http://127.0.0.1:8080", false);
        let instance = BackendInstance::from_config(&cfg).unwrap();
        assert_eq!(instance.host(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn login_is_noop_when_auth_disabled() {
        let cfg = backend("http://127.0.0.1:1", false);
        let instance = BackendInstance::from_config(&cfg).unwrap();
        instance.login().await.unwrap();
    }

    #[test]
    fn cookie_not_valid_before_first_login() {
        let cfg = backend("http://127.0.0.1:8080", true);
        let instance = BackendInstance::from_config(&cfg).unwrap();
        assert!(!instance.cookie_valid());
    }

    #[test]
    fn expire_login_resets_cached_cookie() {
        let cfg = backend("http://127.0.0.1:8080", true);
        let instance = BackendInstance::from_config(&cfg).unwrap();
        instance
            .cookie_expiry_unix
            .store(now_unix() + 3600, Ordering::Release);
        assert!(instance.cookie_valid());
        instance.expire_login();
        assert!(!instance.cookie_valid());
    }

    #[test]
    fn prepare_request_accepts_synthetic_request() {
        let cfg = backend("http://127.0.0.1:8080", false);
        let instance = BackendInstance::from_config(&cfg).unwrap();
        let req = OutboundRequest::synthetic("/api/v2/torrents/info");
        let builder = instance.prepare_request(&req);
        assert!(builder.is_ok());
    }
}
