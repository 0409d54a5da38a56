//! Gateway health probing used by the CLI's `--sse-status` flag.

pub async fn check_health(port: u16) -> anyhow::Result<serde_json::Value> {
    let url = format!("http://127.0.0.1:{}/health", port);
    let resp = reqwest::get(&url).await?;
    let json: serde_json::Value = resp.json().await?;
    Ok(json)
}
