use std::env;

use crate::CoveError;
use crate::redact::scrub;

/// Model API key. Debug output and logs only ever see [`SecretValue::hint`].
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Last four characters, enough to tell two configured keys apart.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "…".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("…{tail}")
    }

    /// Strip this key from text a provider echoed back, then scrub any other secrets.
    pub fn conceal(&self, text: &str) -> String {
        if self.0.is_empty() {
            return scrub(text);
        }
        scrub(&text.replace(self.0.as_str(), "[REDACTED]"))
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue({})", self.hint())
    }
}

/// Read a model credential from the environment.
///
/// Blank values and unfilled `.env` template placeholders (`<your-key>`) count as missing.
pub fn require_env(var: &str) -> Result<SecretValue, CoveError> {
    match env::var(var) {
        Ok(value) => {
            let value = value.trim();
            let placeholder = value.starts_with('<') && value.ends_with('>');
            if value.is_empty() || placeholder {
                Err(CoveError::MissingSecret(var.to_string()))
            } else {
                Ok(SecretValue(value.to_string()))
            }
        }
        Err(_) => Err(CoveError::MissingSecret(var.to_string())),
    }
}
