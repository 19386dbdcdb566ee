use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Environment variable carrying serialized credentials
pub const KEYS_ENV: &str = "LECTERN_API_KEYS";

/// One API key. The value never appears in `Debug` or logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ApiCredential {
    value: String,
    display_name: String,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            display_name: display_name.into(),
        }
    }

    /// Named after a short hash of the value
    pub fn unnamed(value: impl Into<String>) -> Self {
        let value = value.into();
        let display_name = derived_name(&value);
        Self { value, display_name }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("display_name", &self.display_name)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

fn derived_name(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    format!("key-{}", &digest[..16])
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{KEYS_ENV} is not set")]
    Missing,

    #[error("No credentials found in {KEYS_ENV}")]
    Empty,

    #[error("Invalid credential list: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct NamedKey {
    #[serde(default)]
    name: Option<String>,
    value: String,
}

/// Parse either a JSON array of `{"name", "value"}` objects (or plain
/// strings) or a comma-separated list of raw keys
pub fn parse_credentials(raw: &str) -> Result<Vec<ApiCredential>, CredentialError> {
    let raw = raw.trim();
    let credentials: Vec<ApiCredential> = if raw.starts_with('[') {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            Named(NamedKey),
            Bare(String),
        }

        serde_json::from_str::<Vec<Entry>>(raw)?
            .into_iter()
            .map(|entry| match entry {
                Entry::Named(NamedKey {
                    name: Some(name),
                    value,
                }) if !name.trim().is_empty() => ApiCredential::new(value, name),
                Entry::Named(NamedKey { value, .. }) | Entry::Bare(value) => {
                    ApiCredential::unnamed(value)
                }
            })
            .filter(|c| !c.value.trim().is_empty())
            .collect()
    } else {
        raw.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ApiCredential::unnamed)
            .collect()
    };

    if credentials.is_empty() {
        return Err(CredentialError::Empty);
    }
    Ok(credentials)
}

/// Credentials from `LECTERN_API_KEYS`
pub fn credentials_from_env() -> Result<Vec<ApiCredential>, CredentialError> {
    let raw = std::env::var(KEYS_ENV).map_err(|_| CredentialError::Missing)?;
    parse_credentials(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_shows_value() {
        let credential = ApiCredential::new("AIzaSecret", "primary");
        let shown = format!("{credential:?}");
        assert!(shown.contains("primary"));
        assert!(!shown.contains("AIzaSecret"));
    }

    #[test]
    fn test_parse_json_list_with_names() {
        let parsed = parse_credentials(r#"[{"name":"a","value":"k1"},{"value":"k2"},"k3"]"#).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].display_name(), "a");
        assert_eq!(parsed[0].value(), "k1");
        assert!(parsed[1].display_name().starts_with("key-"));
        assert_eq!(parsed[1].display_name().len(), "key-".len() + 16);
        assert_eq!(parsed[2].value(), "k3");
    }

    #[test]
    fn test_parse_comma_list_and_empty() {
        let parsed = parse_credentials(" k1 , ,k2 ").unwrap();
        let values: Vec<&str> = parsed.iter().map(|c| c.value()).collect();
        assert_eq!(values, vec!["k1", "k2"]);
        assert_eq!(parsed[0], ApiCredential::unnamed("k1"));

        assert!(matches!(parse_credentials("  "), Err(CredentialError::Empty)));
        assert!(matches!(parse_credentials("[{\"nope\":1}]"), Err(CredentialError::Invalid(_))));
    }
}
