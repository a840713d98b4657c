use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time;
use tunnelport_common::{
    AllocateRequest, AllocateResponse, Allocation, Credentials, CredentialsResponse, ErrorResponse,
    HeartbeatResponse, PortOwnerRequest, ProbeReport, Stats, UpdateCredentialsRequest, VerifyResponse,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, default_value = "http://localhost:3030", env = "TUNNELPORT_URL")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate a port for an owner (returns the existing one if it already holds a port)
    Alloc {
        owner_id: String,
        #[arg(long, requires = "secret")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        secret: Option<String>,
    },
    /// Release an allocated port
    Release {
        port: u16,
        owner_id: String,
    },
    /// Send a single heartbeat
    Heartbeat {
        port: u16,
        owner_id: String,
    },
    /// Verify that an owner holds a port
    Verify {
        port: u16,
        owner_id: String,
    },
    /// Show or replace the credentials stored for a port
    Credentials {
        port: u16,
        #[arg(long, requires = "secret")]
        username: Option<String>,
        #[arg(long, requires = "username")]
        secret: Option<String>,
    },
    /// Show the latest allocation record for a port
    Status {
        port: u16,
    },
    /// List all active allocations
    List,
    /// Show range usage
    Stats,
    /// Show the latest tunnel health report
    Probe,
    /// Allocate a port, then heartbeat and verify in a loop
    Agent {
        owner_id: String,
        /// Seconds between heartbeats
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Verify ownership every N heartbeats
        #[arg(long, default_value_t = 10)]
        verify_every: u32,
    },
}

fn credentials(username: Option<String>, secret: Option<String>) -> Option<Credentials> {
    match (username, secret) {
        (Some(username), Some(secret)) => Some(Credentials { username, secret }),
        _ => None,
    }
}

async fn read<T: DeserializeOwned>(resp: Response) -> Result<T, Box<dyn std::error::Error>> {
    if resp.status().is_success() {
        return Ok(resp.json().await?);
    }
    let status = resp.status();
    let message = resp
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    Err(format!("{} ({})", message, status).into())
}

async fn expect_ok(resp: Response) -> Result<(), Box<dyn std::error::Error>> {
    if resp.status().is_success() {
        return Ok(());
    }
    let status = resp.status();
    let message = resp
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());
    Err(format!("{} ({})", message, status).into())
}

fn print_allocation(allocation: &Allocation) {
    println!(
        "Port: {}, Owner: {}, Status: {}, Allocated: {}, Last heartbeat: {}, Last verified: {}",
        allocation.port,
        allocation.owner_id,
        allocation.status,
        allocation.allocated_at,
        allocation.last_heartbeat,
        allocation.last_verification,
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Alloc { owner_id, username, secret } => {
            let req = AllocateRequest {
                owner_id,
                credentials: credentials(username, secret),
                metadata: None,
            };
            let resp = client.post(format!("{}/alloc", base)).json(&req).send().await?;
            let alloc_resp: AllocateResponse = read(resp).await?;
            println!("Allocated port: {}", alloc_resp.port);
            print_allocation(&alloc_resp.allocation);
        }
        Commands::Release { port, owner_id } => {
            let req = PortOwnerRequest { port, owner_id };
            let resp = client.post(format!("{}/release", base)).json(&req).send().await?;
            expect_ok(resp).await?;
            println!("Released port: {}", port);
        }
        Commands::Heartbeat { port, owner_id } => {
            let req = PortOwnerRequest { port, owner_id };
            let resp = client.post(format!("{}/heartbeat", base)).json(&req).send().await?;
            let hb: HeartbeatResponse = read(resp).await?;
            println!("Heartbeat for {}: {:?}", hb.port, hb.outcome);
        }
        Commands::Verify { port, owner_id } => {
            let req = PortOwnerRequest { port, owner_id };
            let resp = client.post(format!("{}/verify", base)).json(&req).send().await?;
            let verified: VerifyResponse = read(resp).await?;
            if verified.is_owner {
                println!("Verified at {}", verified.verified_at.map(|t| t.to_string()).unwrap_or_default());
            } else {
                eprintln!("Not the owner: {}", verified.reason.unwrap_or_default());
                std::process::exit(1);
            }
        }
        Commands::Credentials { port, username, secret } => match credentials(username, secret) {
            Some(credentials) => {
                let req = UpdateCredentialsRequest { port, credentials };
                let resp = client.post(format!("{}/credentials", base)).json(&req).send().await?;
                expect_ok(resp).await?;
                println!("Updated credentials for port {}", port);
            }
            None => {
                let resp = client
                    .get(format!("{}/credentials?port={}", base, port))
                    .send()
                    .await?;
                let stored: CredentialsResponse = read(resp).await?;
                match stored.credentials {
                    Some(creds) => println!("Username: {}", creds.username),
                    None => println!("No credentials stored for port {}", port),
                }
            }
        },
        Commands::Status { port } => {
            let resp = client.get(format!("{}/status?port={}", base, port)).send().await?;
            let allocation: Allocation = read(resp).await?;
            print_allocation(&allocation);
        }
        Commands::List => {
            let resp = client.get(format!("{}/list", base)).send().await?;
            let allocations: Vec<Allocation> = read(resp).await?;
            println!("Active Allocations:");
            for allocation in &allocations {
                print_allocation(allocation);
            }
        }
        Commands::Stats => {
            let resp = client.get(format!("{}/stats", base)).send().await?;
            let stats: Stats = read(resp).await?;
            println!(
                "Total: {}, Available: {}, Active: {}, Released: {}, Expired: {}",
                stats.total_ports, stats.available, stats.active, stats.released, stats.expired
            );
        }
        Commands::Probe => {
            let resp = client.get(format!("{}/probe", base)).send().await?;
            let report: Option<ProbeReport> = read(resp).await?;
            match report {
                Some(report) => {
                    println!("Checked at: {}", report.checked_at);
                    println!("Healthy: {:?}", report.healthy);
                    println!("Unhealthy: {:?}", report.unhealthy);
                }
                None => println!("No health check has run yet"),
            }
        }
        Commands::Agent { owner_id, interval, verify_every } => {
            let req = AllocateRequest {
                owner_id: owner_id.clone(),
                credentials: None,
                metadata: None,
            };
            let resp = client.post(format!("{}/alloc", base)).json(&req).send().await?;
            let alloc_resp: AllocateResponse = read(resp).await?;
            let port = alloc_resp.port;
            println!("Allocated port: {}. Starting heartbeat loop...", port);

            let mut ticker = time::interval(Duration::from_secs(interval.max(1)));
            let mut beats: u32 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tokio::signal::ctrl_c() => {
                        let req = PortOwnerRequest { port, owner_id: owner_id.clone() };
                        let _ = client.post(format!("{}/release", base)).json(&req).send().await;
                        println!("Released port {}", port);
                        break;
                    }
                }

                let req = PortOwnerRequest { port, owner_id: owner_id.clone() };
                match client.post(format!("{}/heartbeat", base)).json(&req).send().await {
                    Ok(r) if r.status().is_success() => println!("Heartbeat sent for {}", port),
                    Ok(r) => {
                        eprintln!("Heartbeat failed: {}", r.status());
                        break;
                    }
                    Err(e) => {
                        eprintln!("Heartbeat error: {}", e);
                        break;
                    }
                }

                beats += 1;
                if verify_every > 0 && beats % verify_every == 0 {
                    let resp = client.post(format!("{}/verify", base)).json(&req).send().await?;
                    let verified: VerifyResponse = read(resp).await?;
                    if !verified.is_owner {
                        eprintln!("Lost port {}: {}", port, verified.reason.unwrap_or_default());
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
