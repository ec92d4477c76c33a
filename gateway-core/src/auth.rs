//! Authorization: API key, trusted IP/range, one-shot tokens (spec §4.5).
//!
//! Ported from `authorization.py::Authorization` in full, including its
//! empirical TTL constants. `check_authorized` re-expresses the source's
//! linear `if/elif` chain as an explicit precedence list.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use data_encoding::BASE32;
use rand::RngCore;
use tokio::sync::RwLock;

use crate::error::GatewayError;

/// One-shot tokens expire after this long if never presented (`TOKEN_TIMEOUT`).
pub const TOKEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Trusted connections expire after this long of inactivity (`CONNECTION_TIMEOUT`).
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);
/// How often the pruner sweeps trusted connections (`PRUNE_CHECK_TIME`).
pub const PRUNE_CHECK_TIME: Duration = Duration::from_secs(300);

struct TrustedConnection {
    last_seen: Instant,
}

struct OneShotToken {
    expires_at: Instant,
}

struct Inner {
    api_key: String,
    auth_enabled: bool,
    trusted_ips: Vec<IpAddr>,
    trusted_ranges: Vec<String>,
    trusted_connections: HashMap<IpAddr, TrustedConnection>,
    access_tokens: HashMap<String, OneShotToken>,
}

/// Authorization state. One instance per server; cheap to clone (shares
/// the inner lock).
#[derive(Clone)]
pub struct Authorization {
    api_key_path: PathBuf,
    inner: std::sync::Arc<RwLock<Inner>>,
}

/// The subset of an incoming request authorization cares about, uniform
/// across HTTP and WebSocket origins.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub remote_addr: Option<IpAddr>,
    pub api_key_header: Option<String>,
    pub token_query_param: Option<String>,
}

impl Authorization {
    /// Reads the API key file if present; otherwise generates and
    /// persists a new 32-hex-digit key (spec §4.5, §8 boundary case).
    pub async fn load(api_key_path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let api_key_path = api_key_path.into();
        let api_key = read_or_create_api_key(&api_key_path).await?;
        Ok(Self {
            api_key_path,
            inner: std::sync::Arc::new(RwLock::new(Inner {
                api_key,
                auth_enabled: true,
                trusted_ips: Vec::new(),
                trusted_ranges: Vec::new(),
                trusted_connections: HashMap::new(),
                access_tokens: HashMap::new(),
            })),
        })
    }

    pub async fn configure(&self, enabled: bool, trusted_ips: Vec<IpAddr>, trusted_ranges: Vec<String>) {
        let mut guard = self.inner.write().await;
        guard.auth_enabled = enabled;
        guard.trusted_ips = trusted_ips;
        guard.trusted_ranges = trusted_ranges;
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.auth_enabled
    }

    pub async fn current_api_key(&self) -> String {
        self.inner.read().await.api_key.clone()
    }

    /// `POST /access/api_key`: rotates and persists a new key.
    pub async fn rotate_api_key(&self) -> Result<String, GatewayError> {
        let new_key = generate_api_key();
        write_api_key(&self.api_key_path, &new_key).await?;
        let mut guard = self.inner.write().await;
        guard.api_key = new_key.clone();
        Ok(new_key)
    }

    /// `GET /access/oneshot_token`: issues a fresh one-shot token, valid
    /// immediately, expiring in 5s if unused.
    pub async fn issue_oneshot_token(&self) -> String {
        let token = generate_oneshot_token();
        let mut guard = self.inner.write().await;
        guard.access_tokens.insert(
            token.clone(),
            OneShotToken {
                expires_at: Instant::now() + TOKEN_TIMEOUT,
            },
        );
        token
    }

    /// The precedence chain from spec §4.5. Consumes a one-shot token or
    /// refreshes a trusted connection's timestamp as a side effect of
    /// returning `Ok`.
    pub async fn check_authorized(&self, ctx: &AuthContext) -> Result<(), GatewayError> {
        let mut guard = self.inner.write().await;
        if !guard.auth_enabled {
            return Ok(());
        }

        if let Some(ip) = ctx.remote_addr {
            if let Some(conn) = guard.trusted_connections.get_mut(&ip) {
                conn.last_seen = Instant::now();
                return Ok(());
            }
            if is_trusted(ip, &guard.trusted_ips, &guard.trusted_ranges) {
                guard.trusted_connections.insert(ip, TrustedConnection { last_seen: Instant::now() });
                return Ok(());
            }
        }

        if let Some(key) = &ctx.api_key_header {
            if *key == guard.api_key {
                return Ok(());
            }
        }

        if let Some(token) = &ctx.token_query_param {
            if let Some(entry) = guard.access_tokens.remove(token) {
                if entry.expires_at >= Instant::now() {
                    return Ok(());
                }
            }
        }

        Err(GatewayError::unauthorized("Unauthorized"))
    }

    /// Drops trusted connections whose `last_seen` exceeds
    /// `CONNECTION_TIMEOUT`. Intended to be driven by a 300s periodic
    /// task; exposed directly so callers don't need their own timer.
    pub async fn prune_expired(&self) {
        let mut guard = self.inner.write().await;
        let now = Instant::now();
        guard
            .trusted_connections
            .retain(|_, conn| now.duration_since(conn.last_seen) <= CONNECTION_TIMEOUT);
        guard.access_tokens.retain(|_, tok| tok.expires_at >= now);
    }

    /// Spawns the periodic pruner. Returns immediately.
    pub fn spawn_pruner(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_CHECK_TIME);
            loop {
                ticker.tick().await;
                this.prune_expired().await;
            }
        });
    }
}

/// `ip` is trusted if it's in the explicit list, or if its `/24`-style
/// textual prefix (everything up to the final dot) is in `trusted_ranges`.
fn is_trusted(ip: IpAddr, trusted_ips: &[IpAddr], trusted_ranges: &[String]) -> bool {
    if trusted_ips.contains(&ip) {
        return true;
    }
    let text = ip.to_string();
    if let Some(idx) = text.rfind('.') {
        let prefix = &text[..idx];
        if trusted_ranges.iter().any(|r| r == prefix) {
            return true;
        }
    }
    false
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 32-character base-32 string over 20 bytes of random data, matching
/// `base64.b32encode(os.urandom(20))` (base32 of 20 bytes is exactly 32
/// characters with no padding).
fn generate_oneshot_token() -> String {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    BASE32.encode(&bytes)
}

async fn read_or_create_api_key(path: &Path) -> Result<String, GatewayError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents.trim().to_string()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no API key file found, creating new one");
            let key = generate_api_key();
            write_api_key(path, &key).await?;
            Ok(key)
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_api_key(path: &Path, key: &str) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_key_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key");
        let auth = Authorization::load(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(auth.current_api_key().await.len(), 32);
    }

    #[tokio::test]
    async fn reads_existing_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key");
        tokio::fs::write(&path, "deadbeefdeadbeefdeadbeefdeadbeef").await.unwrap();
        let auth = Authorization::load(&path).await.unwrap();
        assert_eq!(auth.current_api_key().await, "deadbeefdeadbeefdeadbeefdeadbeef");
    }

    #[tokio::test]
    async fn disabled_auth_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authorization::load(dir.path().join("api_key")).await.unwrap();
        auth.configure(false, vec![], vec![]).await;
        let ctx = AuthContext { remote_addr: None, api_key_header: None, token_query_param: None };
        assert!(auth.check_authorized(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn api_key_header_matches() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authorization::load(dir.path().join("api_key")).await.unwrap();
        let key = auth.current_api_key().await;
        let ctx = AuthContext { remote_addr: None, api_key_header: Some(key), token_query_param: None };
        assert!(auth.check_authorized(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn oneshot_token_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authorization::load(dir.path().join("api_key")).await.unwrap();
        let token = auth.issue_oneshot_token().await;
        assert_eq!(token.len(), 32);
        let ctx = AuthContext { remote_addr: None, api_key_header: None, token_query_param: Some(token.clone()) };
        assert!(auth.check_authorized(&ctx).await.is_ok());
        assert!(auth.check_authorized(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn trusted_range_matches_24_bit_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authorization::load(dir.path().join("api_key")).await.unwrap();
        auth.configure(true, vec![], vec!["192.168.1".to_string()]).await;
        let matching: IpAddr = "192.168.1.42".parse().unwrap();
        let non_matching: IpAddr = "192.168.10.42".parse().unwrap();
        let ctx_match = AuthContext { remote_addr: Some(matching), api_key_header: None, token_query_param: None };
        let ctx_no = AuthContext { remote_addr: Some(non_matching), api_key_header: None, token_query_param: None };
        assert!(auth.check_authorized(&ctx_match).await.is_ok());
        assert!(auth.check_authorized(&ctx_no).await.is_err());
    }

    #[tokio::test]
    async fn rotate_api_key_invalidates_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authorization::load(dir.path().join("api_key")).await.unwrap();
        let old_key = auth.current_api_key().await;
        let new_key = auth.rotate_api_key().await.unwrap();
        assert_ne!(old_key, new_key);
        let ctx_old = AuthContext { remote_addr: None, api_key_header: Some(old_key), token_query_param: None };
        assert!(auth.check_authorized(&ctx_old).await.is_err());
    }
}
