//! Small env-var parsing helpers shared by the config structs.

use crate::error::ConfigError;

/// Read an env var, treating unset and empty-after-trim as absent.
pub fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{other}' is not a boolean"),
            }),
        },
    }
}

pub fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not an unsigned integer"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parse_variants() {
        // Unset key falls back to the default.
        assert!(parse_bool_env("CASELINE_TEST_UNSET_BOOL", true).unwrap());
        assert!(!parse_bool_env("CASELINE_TEST_UNSET_BOOL", false).unwrap());
    }
}
