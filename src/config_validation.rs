//! Field-level validation for run configuration.
//!
//! Validators return a [`ValidationError`] naming the offending field.
//! [`ValidationContext`] collects every failure so a bad configuration is
//! reported in one pass instead of one field at a time.

use std::time::Duration;
use thiserror::Error;

/// Validation error with context about which field failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Field '{field}': {message}")]
    FieldError { field: String, message: String },

    #[error("Field '{field}': value {value} is out of range ({min} to {max})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}': invalid format - {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}': invalid value '{value}'. Expected one of: {expected}")]
    InvalidEnum {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Multiple validation errors: {0}")]
    Multiple(String),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collects validation errors across several fields.
#[derive(Debug, Default)]
pub struct ValidationContext {
    errors: Vec<ValidationError>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the error of a validator result, if any.
    pub fn check(&mut self, result: ValidationResult<()>) {
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    /// Add a field error.
    pub fn field_error(&mut self, field: &str, message: String) {
        self.errors.push(ValidationError::FieldError {
            field: field.to_string(),
            message,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the context and return a result.
    ///
    /// A single error is returned as-is; several are joined into `Multiple`.
    pub fn into_result(mut self) -> ValidationResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => {
                let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
                Err(ValidationError::Multiple(messages.join("; ")))
            }
        }
    }
}

/// Validator for target URLs.
pub struct UrlValidator;

impl UrlValidator {
    pub fn validate(url: &str, field: &str) -> ValidationResult<()> {
        if url.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot be empty".to_string(),
            });
        }

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("URL must start with http:// or https://, got: {}", url),
            });
        }

        if url.contains(char::is_whitespace) {
            return Err(ValidationError::InvalidFormat {
                field: field.to_string(),
                message: "URL cannot contain spaces".to_string(),
            });
        }

        Ok(())
    }
}

/// Validator for proxy endpoints given as `host:port` (`[v6addr]:port` for IPv6).
pub struct ProxyAddrValidator;

impl ProxyAddrValidator {
    pub fn validate(addr: &str, field: &str) -> ValidationResult<()> {
        let invalid = |message: String| ValidationError::InvalidFormat {
            field: field.to_string(),
            message,
        };

        if addr.contains("://") {
            return Err(invalid(format!(
                "expected host:port without a scheme, got: {}",
                addr
            )));
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid(format!("expected host:port, got: {}", addr)))?;

        if host.is_empty() || host == "[]" {
            return Err(invalid("host part cannot be empty".to_string()));
        }
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(invalid(format!(
                "IPv6 hosts must be bracketed, e.g. [::1]:1080, got: {}",
                addr
            )));
        }

        match port.parse::<u16>() {
            Ok(0) => Err(invalid("port cannot be 0".to_string())),
            Ok(_) => Ok(()),
            Err(e) => Err(invalid(format!("invalid port '{}': {}", port, e))),
        }
    }
}

/// Validator for durations.
pub struct DurationValidator;

impl DurationValidator {
    pub fn validate_positive(duration: Duration, field: &str) -> ValidationResult<()> {
        if duration.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: "0s".to_string(),
                min: "1ms".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }

    /// Ensure `inner` does not exceed `outer` (e.g. connect vs. total timeout).
    pub fn validate_not_longer(
        inner: Duration,
        inner_field: &str,
        outer: Duration,
        outer_field: &str,
    ) -> ValidationResult<()> {
        if inner > outer {
            return Err(ValidationError::FieldError {
                field: inner_field.to_string(),
                message: format!(
                    "{:?} must not exceed {} ({:?})",
                    inner, outer_field, outer
                ),
            });
        }
        Ok(())
    }
}

/// Validator for numeric ranges.
pub struct RangeValidator;

impl RangeValidator {
    pub fn validate_u64(value: u64, min: u64, max: u64, field: &str) -> ValidationResult<()> {
        if value < min || value > max {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_f64(value: f64, min: f64, max: f64, field: &str) -> ValidationResult<()> {
        if !(value >= min && value <= max) {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_positive_u64(value: u64, field: &str) -> ValidationResult<()> {
        if value == 0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: "unlimited".to_string(),
            });
        }
        Ok(())
    }
}
