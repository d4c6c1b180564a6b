//! Pix key data model and format validation.
//!
//! A Pix key is a routing alias (email, phone, CPF, CNPJ, or random EVP
//! uuid) pointing to exactly one wallet. Validation here is character-level
//! shape checking; the partial unique index on active keys is what
//! ultimately prevents double registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Supported Pix key types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixKeyType {
    Email,
    Phone,
    Cpf,
    Cnpj,
    Evp,
}

impl PixKeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            PixKeyType::Email => "EMAIL",
            PixKeyType::Phone => "PHONE",
            PixKeyType::Cpf => "CPF",
            PixKeyType::Cnpj => "CNPJ",
            PixKeyType::Evp => "EVP",
        }
    }
}

/// Represents a Pix key record from the database.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixKey {
    pub id: Uuid,
    pub key_value: String,
    pub key_type: String,
    pub wallet_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Request body for registering a Pix key.
///
/// ```json
/// { "keyValue": "b@x.com", "keyType": "EMAIL" }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePixKeyRequest {
    pub key_value: String,
    pub key_type: PixKeyType,
}

/// Response body for Pix key endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PixKeyResponse {
    pub id: Uuid,
    pub key_value: String,
    pub key_type: String,
    pub wallet_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<PixKey> for PixKeyResponse {
    fn from(key: PixKey) -> Self {
        Self {
            id: key.id,
            key_value: key.key_value,
            key_type: key.key_type,
            wallet_id: key.wallet_id,
            is_active: key.is_active,
            created_at: key.created_at,
        }
    }
}

/// Validate the shape of a key value against its declared type.
pub fn validate_key(key_value: &str, key_type: PixKeyType) -> Result<(), AppError> {
    let value = key_value.trim();
    if value.is_empty() {
        return Err(AppError::InvalidRequest("Pix key value cannot be empty".into()));
    }
    if value.len() > 500 {
        return Err(AppError::InvalidRequest(
            "Pix key value exceeds 500 characters".into(),
        ));
    }

    let valid = match key_type {
        PixKeyType::Email => is_valid_email(value),
        PixKeyType::Phone => is_valid_phone(value),
        PixKeyType::Cpf => is_valid_document(value, 11),
        PixKeyType::Cnpj => is_valid_document(value, 14),
        PixKeyType::Evp => is_valid_evp(value),
    };

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidRequest(format!(
            "Invalid {} Pix key format",
            key_type.as_str()
        )))
    }
}

fn is_valid_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return false;
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }
    value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'@' | b'.' | b'+' | b'_' | b'-'))
}

/// Brazilian mobile format: +55 followed by an area code starting 1-9 and
/// ten more digits.
fn is_valid_phone(value: &str) -> bool {
    let Some(digits) = value.strip_prefix("+55") else {
        return false;
    };
    digits.len() == 11
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}

/// CPF (11 digits) and CNPJ (14 digits): punctuation is ignored; a value
/// made of one repeated digit is rejected.
fn is_valid_document(value: &str, expected_len: usize) -> bool {
    let digits: Vec<u8> = value.bytes().filter(u8::is_ascii_digit).collect();
    if digits.len() != expected_len {
        return false;
    }
    digits.iter().any(|&d| d != digits[0])
}

/// EVP keys are hyphenated uuids.
fn is_valid_evp(value: &str) -> bool {
    value.len() == 36 && Uuid::parse_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_keys() {
        assert!(validate_key("b@x.com", PixKeyType::Email).is_ok());
        assert!(validate_key("user.name+tag@mail.example.org", PixKeyType::Email).is_ok());
        assert!(validate_key("+5511987654321", PixKeyType::Phone).is_ok());
        assert!(validate_key("123.456.789-09", PixKeyType::Cpf).is_ok());
        assert!(validate_key("12.345.678/0001-95", PixKeyType::Cnpj).is_ok());
        assert!(validate_key("123e4567-e89b-42d3-a456-426614174000", PixKeyType::Evp).is_ok());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(validate_key("", PixKeyType::Email).is_err());
        assert!(validate_key("not-an-email", PixKeyType::Email).is_err());
        assert!(validate_key("a@b", PixKeyType::Email).is_err());
        assert!(validate_key("@x.com", PixKeyType::Email).is_err());
        assert!(validate_key("11987654321", PixKeyType::Phone).is_err());
        assert!(validate_key("+5501987654321", PixKeyType::Phone).is_err());
        assert!(validate_key("+55119876543", PixKeyType::Phone).is_err());
        assert!(validate_key("111.111.111-11", PixKeyType::Cpf).is_err());
        assert!(validate_key("123456789", PixKeyType::Cpf).is_err());
        assert!(validate_key("11111111111111", PixKeyType::Cnpj).is_err());
        assert!(validate_key("not-a-uuid", PixKeyType::Evp).is_err());
        assert!(validate_key("123e4567e89b42d3a456426614174000", PixKeyType::Evp).is_err());
    }
}
