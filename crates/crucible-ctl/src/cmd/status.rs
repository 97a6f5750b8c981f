//! Daemon status command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    store_ok: bool,
    queues: QueueDepths,
    rooms: usize,
}

#[derive(Deserialize)]
struct QueueDepths {
    compile: u64,
    deploy: u64,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port)), "").await?;

    println!("═══════════════════════════════════════");
    println!("  Crucible Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Store            : {}", if resp.store_ok { "ok" } else { "UNREACHABLE" });
    println!("  Compile backlog  : {}", resp.queues.compile);
    println!("  Deploy backlog   : {}", resp.queues.deploy);
    println!("  Active rooms     : {}", resp.rooms);

    Ok(())
}
