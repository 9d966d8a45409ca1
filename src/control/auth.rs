use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("unsupported algorithm `{0}`")]
    Algorithm(String),

    #[error("bad signature")]
    Signature,

    #[error("token expired")]
    Expired,
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// Claims the control channel cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// Operator name, used in audit actions
    #[serde(default)]
    pub sub: String,

    /// Expiry, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

fn mac(secret: &str) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Malformed)
}

fn decode_part<T: for<'de> Deserialize<'de>>(part: &str) -> Result<T, AuthError> {
    let raw = URL_SAFE_NO_PAD.decode(part).map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)
}

/// Verifies an HS256 bearer token and returns its claims.
///
/// `now_secs` is compared against `exp`; tokens without `exp` never expire.
pub fn verify_token(secret: &str, token: &str, now_secs: i64) -> Result<Claims, AuthError> {
    let Some((signing_input, signature)) = token.rsplit_once('.') else {
        return Err(AuthError::Malformed);
    };
    let Some((header, claims)) = signing_input.split_once('.') else {
        return Err(AuthError::Malformed);
    };
    if claims.contains('.') {
        return Err(AuthError::Malformed);
    }

    let header: Header = decode_part(header)?;
    if header.alg != "HS256" {
        return Err(AuthError::Algorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| AuthError::Malformed)?;

    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature).map_err(|_| AuthError::Signature)?;

    let claims: Claims = decode_part(claims)?;
    if claims.exp.is_some_and(|exp| exp <= now_secs) {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

/// Issues an HS256 token for `claims`. Used by operator tooling and tests.
pub fn issue_token(secret: &str, claims: &Claims) -> Result<String, AuthError> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = serde_json::to_vec(claims).map_err(|_| AuthError::Malformed)?;
    let signing_input = format!("{header}.{}", URL_SAFE_NO_PAD.encode(body));

    let mut mac = mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}
