use std::io::Cursor;
use std::time::Duration;

use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::FromRef;
use image::{imageops::FilterType, ImageFormat};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use lazy_static::lazy_static;
use rand::rngs::OsRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::state::AppState;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Password policy: minimum length, and the word "password" itself is
/// banned in any casing.
pub(crate) fn is_acceptable_password(plain: &str) -> bool {
    plain.len() >= 7 && !plain.to_lowercase().contains("password")
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "argon2 hash_password error");
            anyhow::anyhow!(e.to_string())
        })?
        .to_string();
    Ok(hash)
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| {
        error!(error = %e, "argon2 parse hash error");
        anyhow::anyhow!(e.to_string())
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

/// JWT payload for a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: usize,
    pub exp: usize,
    pub iss: String,
    pub aud: String,
}

#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub issuer: String,
    pub audience: String,
    pub ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        let JwtConfig {
            secret,
            issuer,
            audience,
            ttl_days,
        } = state.config.jwt.clone();
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            audience,
            ttl: Duration::from_secs((ttl_days as u64) * 24 * 60 * 60),
        }
    }
}

impl JwtKeys {
    pub fn sign(&self, user_id: Uuid) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(self.ttl.as_secs() as i64);
        let claims = Claims {
            sub: user_id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, "session token signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(user_id = %data.claims.sub, "session token verified");
        Ok(data.claims)
    }
}

pub const MAX_AVATAR_BYTES: usize = 1_000_000;
pub const AVATAR_SIZE: u32 = 250;

const ALLOWED_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Please upload an image file.")]
    BadExtension,
    #[error("File too large")]
    TooLarge,
}

/// Upload filter: runs on the client filename and raw size before any
/// decoding is attempted.
pub fn validate_upload(filename: Option<&str>, size: usize) -> Result<(), UploadError> {
    let name = filename.unwrap_or_default().to_lowercase();
    if !ALLOWED_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return Err(UploadError::BadExtension);
    }
    if size > MAX_AVATAR_BYTES {
        return Err(UploadError::TooLarge);
    }
    Ok(())
}

/// Decode the uploaded image, scale it to the fixed avatar dimensions and
/// re-encode as PNG.
pub fn process_avatar(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let resized = img.resize_exact(AVATAR_SIZE, AVATAR_SIZE, FilterType::Lanczos3);
    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

const ALLOWED_UPDATE_FIELDS: [&str; 4] = ["name", "email", "password", "age"];

/// Whitelist check for PATCH bodies. A single unknown key rejects the
/// whole update before anything is applied.
pub fn updates_allowed<'a>(mut keys: impl Iterator<Item = &'a str>) -> bool {
    keys.all(|k| ALLOWED_UPDATE_FIELDS.contains(&k))
}

#[cfg(test)]
mod password_tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let password = "Secur3P@ssw0rd!";
        let hash = hash_password(password).expect("hashing should succeed");
        assert!(verify_password(password, &hash).expect("verify should succeed"));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let password = "correct-horse-battery-staple";
        let hash = hash_password(password).expect("hashing should succeed");
        assert!(!verify_password("wrong-password", &hash).expect("verify should not error"));
    }

    #[test]
    fn verify_errors_on_malformed_hash() {
        let err = verify_password("anything", "not-a-valid-hash").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn password_policy() {
        assert!(is_acceptable_password("s3cretly"));
        assert!(!is_acceptable_password("short"));
        assert!(!is_acceptable_password("myPassword123"));
    }
}

#[cfg(test)]
mod jwt_tests {
    use super::*;

    fn make_keys() -> JwtKeys {
        let state = AppState::fake();
        JwtKeys::from_ref(&state)
    }

    #[tokio::test]
    async fn sign_and_verify_session_token() {
        let keys = make_keys();
        let user_id = Uuid::new_v4();
        let token = keys.sign(user_id).expect("sign");
        let claims = keys.verify(&token).expect("verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.iss, "test-issuer");
        assert_eq!(claims.aud, "test-aud");
    }

    #[tokio::test]
    async fn successive_tokens_differ() {
        let keys = make_keys();
        let user_id = Uuid::new_v4();
        let a = keys.sign(user_id).expect("sign");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let b = keys.sign(user_id).expect("sign");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn verify_rejects_garbage() {
        let keys = make_keys();
        assert!(keys.verify("not.a.jwt").is_err());
    }
}

#[cfg(test)]
mod upload_tests {
    use super::*;

    #[test]
    fn filter_accepts_allowed_extensions() {
        assert!(validate_upload(Some("photo.jpg"), 10_000).is_ok());
        assert!(validate_upload(Some("photo.jpeg"), 10_000).is_ok());
        assert!(validate_upload(Some("PHOTO.PNG"), 10_000).is_ok());
    }

    #[test]
    fn filter_rejects_other_extensions() {
        let err = validate_upload(Some("photo.gif"), 10_000).unwrap_err();
        assert_eq!(err.to_string(), "Please upload an image file.");
        assert!(validate_upload(Some("photo"), 10_000).is_err());
        assert!(validate_upload(None, 10_000).is_err());
    }

    #[test]
    fn filter_rejects_oversized_files() {
        assert!(validate_upload(Some("photo.png"), MAX_AVATAR_BYTES).is_ok());
        let err = validate_upload(Some("photo.png"), 2_000_000).unwrap_err();
        assert_eq!(err.to_string(), "File too large");
    }

    #[test]
    fn avatar_is_rescaled_and_png_encoded() {
        // 4x4 red square as input, any supported format will do.
        let mut src = Cursor::new(Vec::new());
        image::RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]))
            .write_to(&mut src, ImageFormat::Png)
            .expect("encode fixture");

        let out = process_avatar(&src.into_inner()).expect("process");
        assert_eq!(&out[..8], b"\x89PNG\r\n\x1a\n");

        let round = image::load_from_memory(&out).expect("decode output");
        assert_eq!(round.width(), AVATAR_SIZE);
        assert_eq!(round.height(), AVATAR_SIZE);
    }

    #[test]
    fn garbage_bytes_fail_to_process() {
        assert!(process_avatar(b"definitely not an image").is_err());
    }
}
