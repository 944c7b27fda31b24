use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde_json::Value;

/// Exits non-zero unless the relay at the given URL reports itself healthy
fn main() -> Result<()> {
    let arg = env::args()
        .nth(1)
        .context("Missing URL argument, e.g. http://127.0.0.1:25566/health")?;
    let url = Url::parse(&arg)?;

    let response = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?
        .get(url)
        .send()?;
    if !response.status().is_success() {
        bail!("Health check failed with status {}", response.status());
    }

    let body: Value = response.json()?;
    if body["status"] != "ok" {
        bail!("Relay reported status {}", body["status"]);
    }

    Ok(())
}
