use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use picsync_common::types::UserId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    role: UserRole,
    iat: i64,
    exp: i64,
}

/// Platform-wide role carried in the access token.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

/// Who is calling, as asserted by a validated access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub user_name: String,
    pub role: UserRole,
}

impl UserIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Clone)]
pub struct JwtIdentityService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issues a token for local development and tests. Production tokens come
    /// from the identity provider that shares the secret.
    pub fn issue_token(&self, identity: &UserIdentity) -> anyhow::Result<String> {
        self.issue_token_at(identity, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, identity: &UserIdentity, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: identity.user_id.to_string(),
            name: identity.user_name.clone(),
            role: identity.role,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn validate_token(&self, token: &str) -> anyhow::Result<UserIdentity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = claims
            .sub
            .parse::<UserId>()
            .with_context(|| format!("access token subject '{}' is not a user id", claims.sub))?;

        // Fall back to the id so peers always have something to display.
        let user_name =
            if claims.name.trim().is_empty() { format!("user-{user_id}") } else { claims.name };

        Ok(UserIdentity { user_id, user_name, role: claims.role })
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
