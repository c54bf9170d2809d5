use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT claims as minted by the external auth service. The matchmaking core
/// never issues tokens, it only verifies them against the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_claims_report_expired() {
        let claims = Claims {
            sub: Uuid::now_v7(),
            iat: 0,
            exp: 1,
            jti: Uuid::now_v7(),
        };
        assert!(claims.is_expired());
    }
}
