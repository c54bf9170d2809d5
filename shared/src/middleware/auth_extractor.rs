use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::errors::CoreError;
use crate::types::auth::Claims;

/// Verifies a bearer JWT against `secret` and returns its claims. This core
/// never issues tokens, only verifies ones minted by the identity service.
/// A free function rather than an Axum extractor because the one
/// authenticated surface here is the Socket.IO handshake, which carries the
/// token as a query parameter instead of an `Authorization` header.
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, CoreError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                CoreError::unauthorized("token has expired")
            }
            _ => CoreError::unauthorized(format!("invalid token: {e}")),
        })?;

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use uuid::Uuid;

    fn mint(secret: &str, exp_offset_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::now_v7(),
            iat: now,
            exp: now + exp_offset_secs,
            jti: Uuid::now_v7(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_round_trips() {
        let token = mint("s3cret", 3600);
        let claims = decode_token(&token, "s3cret").unwrap();
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = mint("s3cret", 3600);
        assert!(decode_token(&token, "other").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = mint("s3cret", -3600);
        assert!(decode_token(&token, "s3cret").is_err());
    }
}
