//! Cloud provider credentials
//!
//! AWS credentials in the shape the CAPA installer expects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::ConfigReader;

/// Variable carrying pre-encoded AWS credentials for the CAPA installer
pub const AWS_B64ENCODED_CREDENTIALS: &str = "AWS_B64ENCODED_CREDENTIALS";

/// AWS credentials for the CAPA provider
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    /// AWS access key ID
    pub access_key_id: String,
    /// AWS secret access key
    pub secret_access_key: String,
    /// AWS region
    pub region: String,
    /// Optional session token for temporary credentials
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AwsCredentials {
    /// Read credentials through the configuration reader
    ///
    /// Uses `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION` (or
    /// `AWS_DEFAULT_REGION`) and the optional `AWS_SESSION_TOKEN`. Returns
    /// `None` unless the key pair and region are all non-empty.
    pub fn from_config(config: &ConfigReader) -> Option<Self> {
        let non_empty = |key: &str| config.get_opt(key).filter(|v| !v.is_empty());
        Some(Self {
            access_key_id: non_empty("AWS_ACCESS_KEY_ID")?,
            secret_access_key: non_empty("AWS_SECRET_ACCESS_KEY")?,
            region: non_empty("AWS_REGION").or_else(|| non_empty("AWS_DEFAULT_REGION"))?,
            session_token: non_empty("AWS_SESSION_TOKEN"),
        })
    }

    /// Encode as `AWS_B64ENCODED_CREDENTIALS`
    ///
    /// clusterctl requires credentials in a base64-encoded INI profile format.
    pub fn to_b64_encoded(&self) -> String {
        let mut profile = format!(
            "[default]\naws_access_key_id = {}\naws_secret_access_key = {}\nregion = {}",
            self.access_key_id, self.secret_access_key, self.region
        );

        if let Some(token) = &self.session_token {
            profile.push_str(&format!("\naws_session_token = {}", token));
        }

        STANDARD.encode(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn decode(s: &str) -> String {
        String::from_utf8(STANDARD.decode(s).unwrap()).unwrap()
    }

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "SECRET".to_string(),
            region: "us-west-2".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn encodes_ini_profile() {
        assert_eq!(
            decode(&creds().to_b64_encoded()),
            "[default]\naws_access_key_id = AKID\naws_secret_access_key = SECRET\nregion = us-west-2"
        );
    }

    #[test]
    fn session_token_is_appended() {
        let mut c = creds();
        c.session_token = Some("TOKEN".to_string());
        assert!(decode(&c.to_b64_encoded()).ends_with("\naws_session_token = TOKEN"));
    }

    #[test]
    fn debug_output_hides_secret() {
        let out = format!("{:?}", creds());
        assert!(out.contains("AKID"));
        assert!(!out.contains("SECRET"));
    }

    #[test]
    fn reads_from_config_with_region_fallback() {
        let env: HashMap<&str, &str> = [
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "SECRET"),
            ("AWS_DEFAULT_REGION", "eu-west-1"),
            ("AWS_SESSION_TOKEN", ""),
        ]
        .into_iter()
        .collect();
        let reader = ConfigReader::with_env(move |k| env.get(k).map(|v| v.to_string()));

        let c = AwsCredentials::from_config(&reader).unwrap();
        assert_eq!(c.region, "eu-west-1");
        assert_eq!(c.session_token, None);
    }

    #[test]
    fn incomplete_config_yields_none() {
        let reader = ConfigReader::with_env(|k| (k == "AWS_ACCESS_KEY_ID").then(|| "AKID".to_string()));
        assert!(AwsCredentials::from_config(&reader).is_none());
    }
}
