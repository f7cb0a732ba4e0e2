// CLI execution commands: trigger, list, logs

use std::io::{self, Write};

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;

use super::{base_url, connection_error_message};

/// Helper to handle reqwest errors and produce a user-friendly connection error.
fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// rbd trigger
pub async fn cmd_trigger(host: &str, port: u16, follow: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/executions", base_url(host, port));

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Unknown error");
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }

    let id = body["id"]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("Missing execution id in response"))?;
    println!("Execution {} created", id);

    if follow {
        stream_log(&client, host, port, id).await?;
    }
    Ok(())
}

/// rbd list
pub async fn cmd_list(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/executions", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("Unknown error");
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let executions = body.as_array();
    match executions {
        Some(executions) if !executions.is_empty() => {
            println!("{:<8}{:<12}{:<28}{:<28}", "ID", "STATUS", "STARTED", "ENDED");
            for execution in executions {
                let id = execution["id"].as_i64().unwrap_or(-1);
                let status = execution["status"].as_str().unwrap_or("?");
                let started = execution["start_date"].as_str().unwrap_or("-");
                let ended = execution["end_date"].as_str().unwrap_or("-");
                println!("{:<8}{:<12}{:<28}{:<28}", id, status, started, ended);
            }
        }
        _ => println!("No executions yet."),
    }
    Ok(())
}

/// rbd logs
pub async fn cmd_logs(host: &str, port: u16, id: i64) -> anyhow::Result<()> {
    let client = Client::new();
    stream_log(&client, host, port, id).await
}

/// Stream an execution's log to stdout. The daemon tails live when the
/// execution is still running, so this simply copies bytes until the
/// response ends.
async fn stream_log(client: &Client, host: &str, port: u16, id: i64) -> anyhow::Result<()> {
    let url = format!("{}/executions/{}/logs", base_url(host, port), id);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body["message"].as_str().unwrap_or("Unknown error");
        anyhow::bail!("Error ({}): {}", status, message);
    }

    let mut stream = response.bytes_stream();
    let mut stdout = io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("Stream error: {}", e))?;
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }
    Ok(())
}
