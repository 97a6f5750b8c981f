//! crucible-ctl — command-line interface for the Crucible API.

use anyhow::{Context, Result};

mod cmd;

fn usage() {
    eprintln!("usage: crucible-ctl <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  status        daemon health: queue depths, rooms, store");
    eprintln!("  jobs          list your jobs (newest first)");
    eprintln!("  job <id>      one job with logs and result");
    eprintln!();
    eprintln!("environment:");
    eprintln!("  CRUCIBLE_API_PORT   API port (default 8743)");
    eprintln!("  CRUCIBLE_TOKEN      bearer token for authenticated commands");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let port = std::env::var("CRUCIBLE_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8743u16);
    let token = std::env::var("CRUCIBLE_TOKEN").unwrap_or_default();

    match args.first().map(String::as_str) {
        None | Some("status") => cmd::status::cmd_status(port).await,
        Some("jobs") => cmd::jobs::cmd_jobs(port, &token).await,
        Some("job") => {
            let id = args.get(1).context("usage: crucible-ctl job <id>")?;
            cmd::jobs::cmd_job(port, &token, id).await
        }
        Some(other) => {
            eprintln!("unknown command '{other}'");
            usage();
            std::process::exit(2);
        }
    }
}
