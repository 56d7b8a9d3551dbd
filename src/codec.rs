// src/codec.rs

//! Decoding of JWT-shaped ID tokens and access tokens.
//!
//! Tokens are decoded, never verified: the signature segment is ignored.
//! Claims obtained here are untrusted until the caller has checked the
//! transport (HTTPS) and the issuer/audience for anything beyond display.

use crate::error::KurveError;
use base64::engine::{general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The JOSE header of a token.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TokenHeader {
    pub alg: Option<String>,
    pub typ: Option<String>,
    pub kid: Option<String>,
}

/// The claims carried in a token's payload, kept exactly as encoded.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct DecodedClaims {
    claims: Map<String, Value>,
}

impl DecodedClaims {
    /// Expiry, in seconds since the Unix epoch. Fractional values are truncated.
    pub fn exp(&self) -> Option<u64> {
        let exp = self.claims.get("exp")?;
        exp.as_u64().or_else(|| {
            exp.as_f64()
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| secs as u64)
        })
    }

    pub fn nonce(&self) -> Option<&str> {
        self.str_claim("nonce")
    }

    pub fn sub(&self) -> Option<&str> {
        self.str_claim("sub")
    }

    /// The Azure AD tenant id (`tid`).
    pub fn tenant(&self) -> Option<&str> {
        self.str_claim("tid")
    }

    pub fn iss(&self) -> Option<&str> {
        self.str_claim("iss")
    }

    /// The audience. Array-valued audiences yield their first entry.
    pub fn aud(&self) -> Option<&str> {
        match self.claims.get("aud")? {
            Value::String(s) => Some(s),
            Value::Array(values) => values.first().and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.claims
    }

    fn str_claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Decodes the payload of a three-segment token into its claims.
pub fn decode(raw_token: &str) -> Result<DecodedClaims, KurveError> {
    let (_, payload) = split(raw_token)?;
    let value = decode_segment(payload)?;
    match value {
        Value::Object(claims) => Ok(DecodedClaims { claims }),
        _ => Err(KurveError::MalformedToken("payload is not a JSON object".to_string())),
    }
}

/// Decodes the header segment of a three-segment token.
pub fn decode_header(raw_token: &str) -> Result<TokenHeader, KurveError> {
    let (header, _) = split(raw_token)?;
    serde_json::from_value(decode_segment(header)?)
        .map_err(|e| KurveError::MalformedToken(format!("invalid header: {e}")))
}

fn split(raw_token: &str) -> Result<(&str, &str), KurveError> {
    let parts: Vec<&str> = raw_token.split('.').collect();
    if parts.len() != 3 {
        return Err(KurveError::MalformedToken(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    }
    Ok((parts[0], parts[1]))
}

fn decode_segment(segment: &str) -> Result<Value, KurveError> {
    let bytes = STANDARD
        .decode(to_standard_base64(segment))
        .map_err(|e| KurveError::MalformedToken(format!("invalid base64url: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| KurveError::MalformedToken(format!("invalid JSON: {e}")))
}

/// Converts a base64url segment to padded standard base64.
fn to_standard_base64(segment: &str) -> String {
    let mut converted: String = segment
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while converted.len() % 4 != 0 {
        converted.push('=');
    }
    converted
}

/// A typed view over the claims of an ID token.
#[derive(Debug, Clone, PartialEq)]
pub struct IdToken {
    pub token: String,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub audience: Option<String>,
    pub expiry: Option<u64>,
    pub issued_at: Option<u64>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub email: Option<String>,
    pub preferred_username: Option<String>,
    pub object_id: Option<String>,
    pub tenant_id: Option<String>,
    /// B2C policy (`tfp`, or `acr` on older tenants).
    pub policy: Option<String>,
    pub nonce: Option<String>,
    pub claims: DecodedClaims,
}

impl IdToken {
    pub fn from_claims(token: String, claims: DecodedClaims) -> Self {
        let text = |name: &str| claims.str_claim(name).map(str::to_string);
        let email = text("email").or_else(|| {
            claims
                .get("emails")
                .and_then(Value::as_array)
                .and_then(|emails| emails.first())
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Self {
            issuer: text("iss"),
            subject: text("sub"),
            audience: claims.aud().map(str::to_string),
            expiry: claims.exp(),
            issued_at: claims.get("iat").and_then(Value::as_u64),
            name: text("name"),
            given_name: text("given_name"),
            family_name: text("family_name"),
            email,
            preferred_username: text("preferred_username").or_else(|| text("upn")),
            object_id: text("oid"),
            tenant_id: text("tid"),
            policy: text("tfp").or_else(|| text("acr")),
            nonce: text("nonce"),
            token,
            claims,
        }
    }

    /// Decodes a raw ID token.
    pub fn parse(token: &str) -> Result<Self, KurveError> {
        let claims = decode(token)?;
        Ok(Self::from_claims(token.to_string(), claims))
    }
}
