//! JWT revocation types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Expiry (`exp` claim) of a JWT
pub type JwtExp = DateTime<Utc>;

/// JWT ID (`jti` claim)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JwtJti(String);

impl JwtJti {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::InvalidId {
                kind: "jti",
                value,
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JwtJti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JwtJti {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JwtJti> for String {
    fn from(jti: JwtJti) -> String {
        jti.0
    }
}

/// Convert a UNIX timestamp (seconds) into a [`JwtExp`]
pub fn jwt_exp_from_unix(seconds: i64) -> Result<JwtExp> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| Error::InvalidParameter(format!("exp out of range: {}", seconds)))
}
