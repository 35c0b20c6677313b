use std::sync::OnceLock;

use identity_kernel_core::IdentifyRequest;
use regex_lite::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("At least one of email or phoneNumber must be provided")]
    MissingIdentifier,
    #[error("Email must be a string")]
    EmailNotString,
    #[error("Email cannot be empty")]
    EmptyEmail,
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("Phone number must be a string")]
    PhoneNumberNotString,
    #[error("Phone number cannot be empty")]
    EmptyPhoneNumber,
}

fn email_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^@]+@[^@]+\.[^@]+$").ok()).as_ref()
}

/// Unicode `White_Space` and line terminators plus U+FEFF, without U+0085.
fn is_blank_char(c: char) -> bool {
    (c.is_whitespace() && c != '\u{85}') || c == '\u{feff}'
}

fn is_blank(text: &str) -> bool {
    text.chars().all(is_blank_char)
}

/// An address is one `@`-free local part, an `@`, and a dotted domain, with no blank anywhere.
fn is_valid_email(email: &str) -> bool {
    !email.chars().any(is_blank_char)
        && email_pattern().is_some_and(|pattern| pattern.is_match(email))
}

/// Null, `false`, zero and the empty string count as "not provided".
fn is_provided(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Validate a raw `/identify` body and turn it into a core request.
///
/// Checks run in a fixed order and the first failure wins, so a body with two problems always
/// reports the same one.
///
/// # Errors
/// Returns the first [`ValidationError`] the body trips.
pub fn parse_identify_request(body: &Value) -> Result<IdentifyRequest, ValidationError> {
    let email = body.get("email");
    let phone_number = body.get("phoneNumber");

    if !is_provided(email) && !is_provided(phone_number) {
        return Err(ValidationError::MissingIdentifier);
    }

    let email = if is_provided(email) {
        let Some(email) = email.and_then(Value::as_str) else {
            return Err(ValidationError::EmailNotString);
        };
        if is_blank(email) {
            return Err(ValidationError::EmptyEmail);
        }
        if !is_valid_email(email) {
            return Err(ValidationError::InvalidEmail);
        }
        Some(email)
    } else {
        None
    };

    let phone_number = if is_provided(phone_number) {
        let Some(phone_number) = phone_number.and_then(Value::as_str) else {
            return Err(ValidationError::PhoneNumberNotString);
        };
        if is_blank(phone_number) {
            return Err(ValidationError::EmptyPhoneNumber);
        }
        Some(phone_number)
    } else {
        None
    };

    Ok(IdentifyRequest::new(email, phone_number))
}
