//! Bearer-token handling for the HTTP façade. Rate-limiting and full JWT
//! issuance live outside this crate (SPEC_FULL.md §1 Non-goals); this layer
//! only verifies a token handed to it and extracts the caller's user_id.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[test]
    fn round_trips_a_valid_token() {
        let claims = Claims {
            sub: "alice".to_string(),
            exp: 9_999_999_999,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let decoded = decode_jwt(&token, "test-secret").unwrap();
        assert_eq!(decoded.sub, "alice");
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let claims = Claims {
            sub: "alice".to_string(),
            exp: 9_999_999_999,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"right-secret"),
        )
        .unwrap();

        assert!(decode_jwt(&token, "wrong-secret").is_err());
    }
}
