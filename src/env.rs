//! Environment variable substitution for configuration files
//!
//! Connection parameters usually carry secrets, so the configuration file
//! may reference them as `${VAR_NAME}`. `${VAR_NAME:-fallback}` supplies a
//! value for unset variables.

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;

/// Matches `${VAR_NAME}` and `${VAR_NAME:-fallback}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Substitute environment variable references in a string.
///
/// Returns an error listing every referenced variable that is unset and has
/// no fallback.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing_vars: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        match (env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.as_str().to_string(),
            (Err(_), None) => {
                if !missing_vars.iter().any(|m| m == name) {
                    missing_vars.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing_vars.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_substitution_needed() {
        let input = "region: us-east-2";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_variable_substitution() {
        env::set_var("SA_TEST_KEY_ID", "AKIA123");
        env::set_var("SA_TEST_SECRET", "s3cr3t");
        let result =
            substitute_env_vars("id: ${SA_TEST_KEY_ID}\nsecret: ${SA_TEST_SECRET}-${SA_TEST_SECRET}")
                .unwrap();
        assert_eq!(result, "id: AKIA123\nsecret: s3cr3t-s3cr3t");
        env::remove_var("SA_TEST_KEY_ID");
        env::remove_var("SA_TEST_SECRET");
    }

    #[test]
    fn test_fallback_value() {
        let result = substitute_env_vars("region: ${SA_TEST_UNSET_REGION_98765:-eu-west-1}").unwrap();
        assert_eq!(result, "region: eu-west-1");

        env::set_var("SA_TEST_SET_REGION", "ap-south-1");
        let result = substitute_env_vars("${SA_TEST_SET_REGION:-eu-west-1}").unwrap();
        assert_eq!(result, "ap-south-1");
        env::remove_var("SA_TEST_SET_REGION");
    }

    #[test]
    fn test_missing_variables_listed_once() {
        let err = substitute_env_vars("${SA_MISSING_A_12345} ${SA_MISSING_B_12345} ${SA_MISSING_A_12345}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SA_MISSING_A_12345, SA_MISSING_B_12345"), "{}", err);
    }

    #[test]
    fn test_partial_match_not_substituted() {
        let result = substitute_env_vars("$VAR and {VAR} remain unchanged").unwrap();
        assert_eq!(result, "$VAR and {VAR} remain unchanged");
    }
}
