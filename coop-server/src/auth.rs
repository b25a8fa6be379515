//! Authentication for the transport layer.
//!
//! One of three strategies is fixed for the server's lifetime: `none`
//! grants every caller an anonymous identity with all permissions,
//! `apiKey` maps presented keys to agent identities through a static
//! table, and `jwt` verifies self-contained HS256 tokens.
//!
//! The token scheme is implemented directly over HMAC-SHA-256 with
//! base64url (no padding) segments. Signature comparison goes through
//! `Mac::verify_slice`, which is constant-time over equal-length inputs
//! and rejects length mismatches outright.

use crate::error::ErrorCode;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use coop_core::{AuthContext, JsonMap, Permission, Permissions};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default token lifetime in seconds.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("authentication required")]
    AuthRequired,
    #[error("invalid authorization header format")]
    InvalidFormat,
    #[error("invalid API key")]
    InvalidKey,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token has expired")]
    TokenExpired,
    #[error("invalid token issuer")]
    InvalidIssuer,
    #[error("invalid token audience")]
    InvalidAudience,
    #[error("auth strategy is not configured")]
    NotConfigured,
    #[error("permission denied")]
    PermissionDenied,
    #[error("unknown auth strategy: {0}")]
    UnknownStrategy(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::AuthRequired => ErrorCode::AuthRequired,
            AuthError::InvalidFormat => ErrorCode::InvalidFormat,
            AuthError::InvalidKey => ErrorCode::InvalidKey,
            AuthError::InvalidToken => ErrorCode::InvalidToken,
            AuthError::InvalidSignature => ErrorCode::InvalidSignature,
            AuthError::TokenExpired => ErrorCode::TokenExpired,
            AuthError::InvalidIssuer => ErrorCode::InvalidIssuer,
            AuthError::InvalidAudience => ErrorCode::InvalidAudience,
            AuthError::NotConfigured => ErrorCode::NotConfigured,
            AuthError::PermissionDenied => ErrorCode::PermissionDenied,
            AuthError::UnknownStrategy(_) => ErrorCode::UnknownStrategy,
        }
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Injectable clock so token time checks are deterministic in tests.
pub trait JwtClock: Send + Sync {
    /// Current time as unix seconds.
    fn now_unix(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl JwtClock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Fixed time for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl JwtClock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.0
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// JWT signing secret. Debug output is redacted.
#[derive(Clone)]
pub struct JwtSecret(SecretString);

impl JwtSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JwtSecret(..)")
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: JwtSecret,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub expires_in_secs: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyEntry {
    pub agent_id: String,
    pub permissions: Permissions,
}

/// Strategy selected once at startup. Request handling dispatches on the
/// variant, never on a configuration string.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    None,
    ApiKey(HashMap<String, ApiKeyEntry>),
    Jwt(JwtConfig),
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub strategy: AuthStrategy,
    /// Whether the health path bypasses authentication.
    pub allow_health_without_auth: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            strategy: AuthStrategy::None,
            allow_health_without_auth: true,
        }
    }
}

impl AuthConfig {
    /// Read the auth configuration from `COOP_*` environment variables.
    ///
    /// `COOP_AUTH_STRATEGY` selects none|apiKey|jwt. API keys come from
    /// `COOP_API_KEYS` as `key:agentId:perm,perm,...` entries; `admin`
    /// implies read and write. JWT settings come from `COOP_JWT_SECRET`,
    /// `COOP_JWT_ISSUER`, `COOP_JWT_AUDIENCE`, `COOP_JWT_EXPIRES_IN`.
    pub fn from_env() -> Result<Self, AuthError> {
        let allow_health_without_auth =
            std::env::var("COOP_AUTH_ALLOW_HEALTH").as_deref() != Ok("false");
        let strategy = match std::env::var("COOP_AUTH_STRATEGY").ok().as_deref() {
            None | Some("none") => AuthStrategy::None,
            Some("apiKey") => {
                let raw = std::env::var("COOP_API_KEYS").unwrap_or_default();
                AuthStrategy::ApiKey(parse_api_keys(&raw))
            }
            Some("jwt") => {
                let secret =
                    std::env::var("COOP_JWT_SECRET").map_err(|_| AuthError::NotConfigured)?;
                let expires_in_secs = std::env::var("COOP_JWT_EXPIRES_IN")
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
                AuthStrategy::Jwt(JwtConfig {
                    secret: JwtSecret::new(secret),
                    issuer: std::env::var("COOP_JWT_ISSUER").ok(),
                    audience: std::env::var("COOP_JWT_AUDIENCE").ok(),
                    expires_in_secs,
                })
            }
            Some(other) => return Err(AuthError::UnknownStrategy(other.to_string())),
        };
        Ok(Self {
            strategy,
            allow_health_without_auth,
        })
    }
}

/// Parse the API-key table. Entries are comma-delimited with
/// colon-delimited fields; a comma-separated token without a colon
/// extends the previous entry's permission list, so
/// `key1:agent1:read,write,key2:agent2:admin` parses as two entries.
pub fn parse_api_keys(raw: &str) -> HashMap<String, ApiKeyEntry> {
    let mut keys = HashMap::new();
    let mut current: Option<(String, String, Vec<String>)> = None;

    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.contains(':') {
            if let Some(entry) = current.take() {
                insert_key_entry(&mut keys, entry);
            }
            let mut fields = token.split(':');
            let key = fields.next().unwrap_or_default().to_string();
            let agent_id = fields.next().unwrap_or_default().to_string();
            let perms: Vec<String> = fields.next().map(|p| vec![p.to_string()]).unwrap_or_default();
            if !key.is_empty() && !agent_id.is_empty() {
                current = Some((key, agent_id, perms));
            }
        } else if let Some((_, _, perms)) = current.as_mut() {
            perms.push(token.to_string());
        }
    }
    if let Some(entry) = current.take() {
        insert_key_entry(&mut keys, entry);
    }
    keys
}

fn insert_key_entry(
    keys: &mut HashMap<String, ApiKeyEntry>,
    (key, agent_id, perms): (String, String, Vec<String>),
) {
    // Permission tokens match by substring, mirroring the wire format's
    // loose grammar; admin implies read and write.
    let admin = perms.iter().any(|p| p.contains("admin"));
    let permissions = Permissions {
        read: admin || perms.iter().any(|p| p.contains("read")),
        write: admin || perms.iter().any(|p| p.contains("write")),
        admin,
    };
    keys.insert(key, ApiKeyEntry { agent_id, permissions });
}

// ============================================================================
// AUTH MANAGER
// ============================================================================

pub struct AuthManager {
    strategy: AuthStrategy,
    allow_health_without_auth: bool,
    clock: Arc<dyn JwtClock>,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AuthConfig, clock: Arc<dyn JwtClock>) -> Self {
        Self {
            strategy: config.strategy,
            allow_health_without_auth: config.allow_health_without_auth,
            clock,
        }
    }

    /// Authenticate from the raw authorization header value.
    ///
    /// Under the `none` strategy this succeeds unconditionally. Otherwise
    /// the header must split into exactly `<scheme> <token>`; a missing or
    /// malformed header fails before the token is ever inspected.
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthContext, AuthError> {
        let strategy = match &self.strategy {
            AuthStrategy::None => {
                let mut context = AuthContext::new("anonymous", Permissions::all());
                context
                    .metadata
                    .insert("strategy".to_string(), json!("none"));
                return Ok(context);
            }
            other => other,
        };

        let header = header.ok_or(AuthError::AuthRequired)?;
        let parts: Vec<&str> = header.split(' ').collect();
        let [scheme, token] = parts.as_slice() else {
            return Err(AuthError::InvalidFormat);
        };

        match strategy {
            AuthStrategy::ApiKey(keys) => {
                if *scheme != "ApiKey" {
                    return Err(AuthError::InvalidFormat);
                }
                let entry = keys.get(*token).ok_or(AuthError::InvalidKey)?;
                let mut context = AuthContext::new(entry.agent_id.clone(), entry.permissions);
                context
                    .metadata
                    .insert("strategy".to_string(), json!("apiKey"));
                Ok(context)
            }
            AuthStrategy::Jwt(config) => {
                if *scheme != "Bearer" {
                    return Err(AuthError::InvalidFormat);
                }
                let claims = verify_token(config, self.clock.as_ref(), token)?;
                let agent_id = claims
                    .get("sub")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let permissions = claims
                    .get("permissions")
                    .and_then(|v| serde_json::from_value::<Permissions>(v.clone()).ok())
                    .unwrap_or(Permissions {
                        read: true,
                        write: false,
                        admin: false,
                    });
                let mut context = AuthContext::new(agent_id, permissions);
                context
                    .metadata
                    .insert("strategy".to_string(), json!("jwt"));
                context
                    .metadata
                    .insert("claims".to_string(), Value::Object(claims));
                Ok(context)
            }
            AuthStrategy::None => unreachable!("handled above"),
        }
    }

    /// Sign caller-supplied claims into a token. Only valid under the
    /// `jwt` strategy.
    pub fn sign(&self, claims: &JsonMap) -> Result<String, AuthError> {
        match &self.strategy {
            AuthStrategy::Jwt(config) => sign_token(config, self.clock.as_ref(), claims),
            _ => Err(AuthError::NotConfigured),
        }
    }

    /// Reject unless the named permission bit is set.
    pub fn check_permission(
        &self,
        context: &AuthContext,
        permission: Permission,
    ) -> Result<(), AuthError> {
        if context.permissions.has(permission) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied)
        }
    }

    /// Hard-coded carve-out for the health path, toggleable by config.
    pub fn can_access_without_auth(&self, path: &str) -> bool {
        matches!(&self.strategy, AuthStrategy::None)
            || (self.allow_health_without_auth && path == "/health")
    }
}

// ============================================================================
// TOKEN SCHEME
// ============================================================================

fn encode_segment(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn mac_for(config: &JwtConfig) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(config.secret.expose().as_bytes())
        .map_err(|_| AuthError::NotConfigured)
}

fn sign_token(
    config: &JwtConfig,
    clock: &dyn JwtClock,
    claims: &JsonMap,
) -> Result<String, AuthError> {
    let header = json!({"alg": "HS256", "typ": "JWT"});
    let now = clock.now_unix();

    let mut payload = claims.clone();
    payload.insert("iat".to_string(), json!(now));
    payload.insert("exp".to_string(), json!(now + config.expires_in_secs));
    if let Some(issuer) = &config.issuer {
        payload.insert("iss".to_string(), json!(issuer));
    }
    if let Some(audience) = &config.audience {
        payload.insert("aud".to_string(), json!(audience));
    }

    let header_b64 =
        encode_segment(&serde_json::to_vec(&header).map_err(|_| AuthError::InvalidToken)?);
    let payload_b64 =
        encode_segment(&serde_json::to_vec(&payload).map_err(|_| AuthError::InvalidToken)?);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = mac_for(config)?;
    mac.update(signing_input.as_bytes());
    let signature = encode_segment(mac.finalize().into_bytes().as_slice());

    Ok(format!("{signing_input}.{signature}"))
}

fn verify_token(
    config: &JwtConfig,
    clock: &dyn JwtClock,
    token: &str,
) -> Result<JsonMap, AuthError> {
    let segments: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = segments.as_slice() else {
        return Err(AuthError::InvalidToken);
    };

    let presented = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidSignature)?;
    let mut mac = mac_for(config)?;
    mac.update(format!("{header_b64}.{payload_b64}").as_bytes());
    mac.verify_slice(&presented)
        .map_err(|_| AuthError::InvalidSignature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: JsonMap =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidToken)?;

    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if exp < clock.now_unix() {
            return Err(AuthError::TokenExpired);
        }
    }
    if let Some(expected) = &config.issuer {
        match claims.get("iss").and_then(Value::as_str) {
            Some(iss) if iss == expected => {}
            _ => return Err(AuthError::InvalidIssuer),
        }
    }
    if let Some(expected) = &config.audience {
        match claims.get("aud").and_then(Value::as_str) {
            Some(aud) if aud == expected => {}
            _ => return Err(AuthError::InvalidAudience),
        }
    }
    Ok(claims)
}
