use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_ELASTIC_SERVER: &str = "https://localhost:9200";
pub const DEFAULT_DOCCANO_SERVER: &str = "http://localhost:8000";
pub const DEFAULT_DOCCANO_PROJECT_DIR: &str = "./doccano_projects";
pub const DEFAULT_MCTRAINER_SERVER: &str = "http://localhost:8001";

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} env variable not set")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Transport settings shared by every client.
#[derive(Debug, Clone, Default)]
pub struct Transport {
    pub proxy: Option<String>,
    pub accept_invalid_certs: bool,
}

impl Transport {
    pub fn from_env() -> Self {
        Self {
            proxy: optional("http_proxy").or_else(|| optional("HTTP_PROXY")),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub server: String,
    pub api_id: String,
    pub api_key: String,
    pub transport: Transport,
}

impl SearchConfig {
    pub fn from_env() -> Result<Self> {
        let verify = optional("ELASTIC_VERIFY_CERTS")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);
        Ok(Self {
            server: optional("ELASTIC_SERVER").unwrap_or_else(|| DEFAULT_ELASTIC_SERVER.into()),
            api_id: required("ELASTIC_API_ID")?,
            api_key: required("ELASTIC_API_KEY")?,
            transport: Transport {
                accept_invalid_certs: !verify,
                ..Transport::from_env()
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnnotationConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    /// Where created/updated project metadata is written.
    pub project_dir: PathBuf,
    pub transport: Transport,
}

impl AnnotationConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: optional("DOCCANO_SERVER").unwrap_or_else(|| DEFAULT_DOCCANO_SERVER.into()),
            username: required("DOCCANO_USERNAME")?,
            password: required("DOCCANO_PASSWORD")?,
            project_dir: optional("DOCCANO_PROJECT_DIR")
                .unwrap_or_else(|| DEFAULT_DOCCANO_PROJECT_DIR.into())
                .into(),
            transport: Transport::from_env(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub transport: Transport,
}

impl TrainerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: optional("MCTRAINER_SERVER").unwrap_or_else(|| DEFAULT_MCTRAINER_SERVER.into()),
            username: required("MCTRAINER_USERNAME")?,
            password: required("MCTRAINER_PASSWORD")?,
            transport: Transport::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_names_it() {
        let err = required("BIOEXT_TEST_SURELY_UNSET").unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: BIOEXT_TEST_SURELY_UNSET env variable not set"
        );
    }

    #[test]
    fn elastic_cert_verification_can_be_turned_off() {
        std::env::set_var("ELASTIC_API_ID", "id");
        std::env::set_var("ELASTIC_API_KEY", "key");

        std::env::set_var("ELASTIC_VERIFY_CERTS", "false");
        let config = SearchConfig::from_env().unwrap();
        assert!(config.transport.accept_invalid_certs);

        std::env::set_var("ELASTIC_VERIFY_CERTS", "true");
        assert!(!SearchConfig::from_env().unwrap().transport.accept_invalid_certs);

        std::env::remove_var("ELASTIC_VERIFY_CERTS");
        assert!(!SearchConfig::from_env().unwrap().transport.accept_invalid_certs);
    }

    #[test]
    fn blank_optional_var_is_ignored() {
        std::env::set_var("BIOEXT_TEST_BLANK", "  ");
        assert_eq!(optional("BIOEXT_TEST_BLANK"), None);
    }
}
