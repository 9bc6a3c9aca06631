//! `redb-meshctl` — a thin client over one node's `ops` introspection/control
//! surface. Not a SQL client and not a membership-management tool; every
//! other form of local operational tooling is out of scope (§1).

use std::env;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let base_url = env::var("REDB_MESHCTL_ADDR").unwrap_or_else(|_| "http://127.0.0.1:7600".to_string());
    let client = reqwest::Client::new();

    let result = match args.first().map(String::as_str) {
        Some("nodes") => get(&client, &base_url, "/v1/nodes").await,
        Some("stream") => match args.get(1) {
            Some(id) => get(&client, &base_url, &format!("/v1/streams/{id}")).await,
            None => Err("usage: redb-meshctl stream <stream_id>".to_string()),
        },
        Some("delivery-log") => match (args.get(1), args.get(2)) {
            (Some(stream_id), Some(message_id)) => get(&client, &base_url, &format!("/v1/streams/{stream_id}/messages/{message_id}/delivery-log")).await,
            _ => Err("usage: redb-meshctl delivery-log <stream_id> <message_id>".to_string()),
        },
        Some("drain") => {
            let grace_ms: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5_000);
            post(&client, &base_url, "/v1/control/drain", Some(serde_json::json!({ "grace_ms": grace_ms }))).await
        }
        Some("rotate-key") => post(&client, &base_url, "/v1/control/rotate-key", None).await,
        Some("force-snapshot") => match args.get(1) {
            Some(group_id) => post(&client, &base_url, &format!("/v1/control/force-snapshot/{group_id}"), None).await,
            None => Err("usage: redb-meshctl force-snapshot <group_id>".to_string()),
        },
        _ => Err(usage()),
    };

    match result {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn usage() -> String {
    "usage: redb-meshctl <nodes|stream|delivery-log|drain|rotate-key|force-snapshot> [args...]".to_string()
}

async fn get(client: &reqwest::Client, base_url: &str, path: &str) -> Result<String, String> {
    let resp = client.get(format!("{base_url}{path}")).send().await.map_err(|e| format!("request failed: {e}"))?;
    render(resp).await
}

async fn post(client: &reqwest::Client, base_url: &str, path: &str, body: Option<serde_json::Value>) -> Result<String, String> {
    let mut req = client.post(format!("{base_url}{path}"));
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.map_err(|e| format!("request failed: {e}"))?;
    render(resp).await
}

async fn render(resp: reqwest::Response) -> Result<String, String> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(format!("{status}: {body}"))
    }
}
