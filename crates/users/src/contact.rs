//! Contact sub-entities: email and phone intents, and the encrypted
//! verification-code pair.

use serde::{Deserialize, Serialize};

use keyforge_core::{DomainError, DomainResult};

/// A verification code as produced by the injected code generator.
///
/// Only `encrypted` is ever persisted in events; `plain` may be surfaced to
/// the caller when the intent asked for a return code, and is dropped
/// otherwise (delivery is an external concern).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCode {
    pub encrypted: String,
    pub plain: String,
}

/// Requested email state for a create/change intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub address: String,
    /// Mark the address verified without a code (trusted import).
    pub verified: bool,
    /// Surface the plaintext verification code to the caller instead of
    /// delivering it out of band.
    pub return_code: bool,
}

impl Email {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            verified: false,
            return_code: false,
        }
    }

    /// Structural validation: `local@domain`, both parts non-empty.
    pub fn validate(&self) -> DomainResult<()> {
        let address = self.address.trim();
        match address.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(DomainError::invalid_argument(format!(
                "invalid email address '{}'",
                self.address
            ))),
        }
    }
}

/// Requested phone state for a create/change intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    pub number: String,
    pub verified: bool,
    pub return_code: bool,
}

impl Phone {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            verified: false,
            return_code: false,
        }
    }

    /// Normalize to `+` followed by digits, stripping separators.
    ///
    /// Fails with `InvalidArgument` when the number has no leading `+`, no
    /// digits, or contains anything that is not a digit/separator.
    pub fn normalized(&self) -> DomainResult<String> {
        let trimmed = self.number.trim();
        let Some(rest) = trimmed.strip_prefix('+') else {
            return Err(DomainError::invalid_argument(format!(
                "phone number '{}' must start with '+'",
                self.number
            )));
        };

        let mut digits = String::with_capacity(rest.len());
        for c in rest.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
            } else if !matches!(c, ' ' | '-' | '(' | ')' | '/') {
                return Err(DomainError::invalid_argument(format!(
                    "phone number '{}' contains invalid character '{c}'",
                    self.number
                )));
            }
        }

        if digits.is_empty() {
            return Err(DomainError::invalid_argument(format!(
                "phone number '{}' has no digits",
                self.number
            )));
        }

        Ok(format!("+{digits}"))
    }
}
