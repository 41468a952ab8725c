//! FILENAME: core/engine/src/config.rs
//! PURPOSE: Engine configuration record.
//! CONTEXT: Construction-time options; validated once, then read-only for
//! the lifetime of the engine instance.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Configuration for an engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether adjacent numeric blocks coalesce into matrix vertices at build.
    pub matrix_detection: bool,
    /// Minimum block dimension (both width and height) that triggers coalescing.
    pub matrix_detection_threshold: u32,
    /// Affects string comparison in the function library.
    pub case_sensitive: bool,
    /// Function argument separator used by the formula grammar.
    pub function_arg_separator: char,
    /// Function-name alias language. Only canonical "enGB" names ship.
    pub language: String,
    /// Decimal places used to round near-integer floats on write-back.
    pub precision_rounding: u32,
    /// Enables numeric equality with a floating-point epsilon.
    pub smart_rounding: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            matrix_detection: false,
            matrix_detection_threshold: 2,
            case_sensitive: false,
            function_arg_separator: ',',
            language: "enGB".to_string(),
            precision_rounding: 14,
            smart_rounding: true,
        }
    }
}

impl EngineConfig {
    /// Validates option ranges. Called once at engine construction.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.matrix_detection_threshold < 1 {
            return Err(EngineError::InvalidConfig(
                "matrix_detection_threshold must be at least 1".to_string(),
            ));
        }
        if !self.function_arg_separator.is_ascii_punctuation() {
            return Err(EngineError::InvalidConfig(format!(
                "function_arg_separator must be ASCII punctuation, got {:?}",
                self.function_arg_separator
            )));
        }
        if self.function_arg_separator == ':' || self.function_arg_separator == '"' {
            return Err(EngineError::InvalidConfig(
                "function_arg_separator collides with the reference grammar".to_string(),
            ));
        }
        if self.language != "enGB" {
            return Err(EngineError::InvalidConfig(format!(
                "unknown language: {}",
                self.language
            )));
        }
        if self.precision_rounding > 17 {
            return Err(EngineError::InvalidConfig(
                "precision_rounding must be at most 17".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_threshold() {
        let config = EngineConfig {
            matrix_detection_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_colon_separator() {
        let config = EngineConfig {
            function_arg_separator: ':',
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_semicolon_separator() {
        let config = EngineConfig {
            function_arg_separator: ';',
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
