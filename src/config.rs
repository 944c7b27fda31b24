use anyhow::Result;
use clap_serde_derive::ClapSerde;

/// Service configuration, merged from defaults, the TOML file and the command line
#[derive(ClapSerde, Debug)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(25566)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// API key used to authenticate against the Gemini API
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub(crate) api_key: String,

    /// Base URL of the Gemini API
    #[default("https://generativelanguage.googleapis.com/v1beta".to_string())]
    #[arg(long, env)]
    pub(crate) api_base_url: String,

    /// Image model used for generation
    #[default("gemini-2.5-flash-image-preview".to_string())]
    #[arg(short, long, env)]
    pub(crate) model: String,

    /// Maximum accepted request body size in bytes
    #[default(20_000_000)]
    #[arg(long, env)]
    pub(crate) body_limit: usize,

    /// OTLP collector endpoint, telemetry export is disabled when empty
    #[arg(long, env)]
    pub(crate) otlp_endpoint: String,
}

impl Config {
    /// Values missing from the file keep their defaults
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    /// The configured API key, if one was provided
    pub fn api_key(&self) -> Option<&str> {
        Some(self.api_key.trim()).filter(|key| !key.is_empty())
    }

    pub fn otlp_endpoint(&self) -> Option<&str> {
        Some(self.otlp_endpoint.trim()).filter(|endpoint| !endpoint.is_empty())
    }
}
