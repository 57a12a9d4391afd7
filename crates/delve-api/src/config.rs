use anyhow::{Context, Result};
use std::env;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: String,
    pub auth_token: Option<String>,
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::DEFAULT_LISTEN_ADDR.to_string(),
            auth_token: None,
            max_upload_bytes: Self::DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl AppConfig {
    const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";
    const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

    pub fn from_env() -> Result<Self> {
        let listen_addr =
            env::var("DELVE_API_ADDR").unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_string());

        let auth_token = env::var("DELVE_API_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let max_upload_bytes = env::var("DELVE_API_MAX_UPLOAD_BYTES")
            .ok()
            .map(|value| {
                value
                    .trim()
                    .parse::<usize>()
                    .with_context(|| "DELVE_API_MAX_UPLOAD_BYTES must be a byte count")
            })
            .transpose()?
            .filter(|value| *value > 0)
            .unwrap_or(Self::DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            listen_addr,
            auth_token,
            max_upload_bytes,
        })
    }
}
