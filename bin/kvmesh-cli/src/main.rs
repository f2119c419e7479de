//! kvmesh CLI - Admin Command Line Interface
//!
//! Talks to one node over its HTTP API. Data commands are routed by that
//! node to the key's owner.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kvmesh_common::Route;
use kvmesh_proto::messages::decode_message;
use kvmesh_proto::{Operation, SystemMessage, SystemResponse};
use prost::Message;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kvmesh-cli")]
#[command(about = "kvmesh Admin CLI")]
#[command(version)]
struct Args {
    /// Node endpoint
    #[arg(short, long, env = "KVMESH_ENDPOINT", default_value = "http://127.0.0.1:3320")]
    endpoint: String,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the partition routing table
    RoutingTable,
    /// Check whether the node accepts data operations
    Health,
    /// Ping the node over the member-to-member channel
    Ping,
    /// Store a value
    Put {
        dmap: String,
        key: String,
        value: String,
        /// Time to live in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Fetch a value
    Get { dmap: String, key: String },
    /// Delete a key
    Del { dmap: String, key: String },
    /// List the keys the node holds in one partition
    Scan {
        dmap: String,
        /// Partition id
        #[arg(short, long)]
        part_id: u64,
        /// Scan the backup copy instead of the primary
        #[arg(long)]
        backup: bool,
        /// Keys per page
        #[arg(long, default_value = "100")]
        count: u32,
    },
}

#[derive(Deserialize)]
struct RoutingTableBody {
    version: u64,
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct ScanPage {
    cursor: u64,
    keys: Vec<String>,
}

struct Client {
    http: reqwest::Client,
    endpoint: String,
}

impl Client {
    fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn key_url(&self, dmap: &str, key: &str) -> String {
        self.url(&format!("/v1/dmap/{dmap}/{key}"))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("request failed with status {status}: {body}")
    }

    async fn routing_table(&self) -> Result<RoutingTableBody> {
        let response = self.http.get(self.url("/v1/cluster/routing-table")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn health(&self) -> Result<(bool, String)> {
        let response = self.http.get(self.url("/health")).send().await?;
        let healthy = response.status().is_success();
        Ok((healthy, response.text().await?))
    }

    async fn system(&self, message: SystemMessage) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(self.url("/v1/system"))
            .body(message.encode_to_vec())
            .send()
            .await?;
        let body = Self::check(response).await?.bytes().await?;
        Ok(decode_message::<SystemResponse>(&body)?.into_result()?)
    }

    async fn put(&self, dmap: &str, key: &str, value: String, ttl_ms: Option<u64>) -> Result<()> {
        let mut request = self.http.put(self.key_url(dmap, key)).body(value);
        if let Some(ttl) = ttl_ms {
            request = request.query(&[("ttl_ms", ttl)]);
        }
        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn get(&self, dmap: &str, key: &str) -> Result<Vec<u8>> {
        let response = self.http.get(self.key_url(dmap, key)).send().await?;
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    async fn delete(&self, dmap: &str, key: &str) -> Result<()> {
        let response = self.http.delete(self.key_url(dmap, key)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn scan_page(&self, dmap: &str, part_id: u64, backup: bool, cursor: u64, count: u32) -> Result<ScanPage> {
        let response = self
            .http
            .get(self.url(&format!("/v1/dmap/{dmap}/scan")))
            .query(&[
                ("part_id", part_id.to_string()),
                ("backup", backup.to_string()),
                ("cursor", cursor.to_string()),
                ("count", count.to_string()),
            ])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

fn print_routing_table(table: &RoutingTableBody) {
    println!("Routing Table (version {})", table.version);
    println!("==========================");
    println!("{:<6} {:<24} REPLICAS", "PART", "PRIMARY");
    for (part_id, route) in table.routes.iter().enumerate() {
        let primary = route.primary_owners.last().map_or("-", String::as_str);
        let replicas = if route.replica_owners.is_empty() {
            "-".to_string()
        } else {
            route.replica_owners.join(",")
        };
        println!("{part_id:<6} {primary:<24} {replicas}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let client = Client::new(&args.endpoint, Duration::from_millis(args.timeout_ms))?;
    debug!("Using endpoint {}", client.endpoint);

    match args.command {
        Commands::RoutingTable => {
            let table = client.routing_table().await?;
            print_routing_table(&table);
        }
        Commands::Health => {
            let (healthy, body) = client.health().await?;
            println!("{body}");
            if !healthy {
                std::process::exit(1);
            }
        }
        Commands::Ping => {
            let reply = client
                .system(SystemMessage::new(Operation::Ping, Vec::new()))
                .await?;
            println!("PONG from {}", String::from_utf8_lossy(&reply));
        }
        Commands::Put {
            dmap,
            key,
            value,
            ttl_ms,
        } => {
            client.put(&dmap, &key, value, ttl_ms).await?;
            println!("OK");
        }
        Commands::Get { dmap, key } => {
            let value = client
                .get(&dmap, &key)
                .await
                .with_context(|| format!("failed to get {dmap}/{key}"))?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Del { dmap, key } => {
            client.delete(&dmap, &key).await?;
            println!("OK");
        }
        Commands::Scan {
            dmap,
            part_id,
            backup,
            count,
        } => {
            let mut cursor = 0;
            let mut total = 0usize;
            loop {
                let page = client.scan_page(&dmap, part_id, backup, cursor, count).await?;
                total += page.keys.len();
                for key in &page.keys {
                    println!("{key}");
                }
                if page.cursor == 0 {
                    break;
                }
                cursor = page.cursor;
            }
            println!("({total} keys)");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = Client::new("http://10.0.0.1:3320/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/health"), "http://10.0.0.1:3320/health");
        assert_eq!(
            client.key_url("users", "alice"),
            "http://10.0.0.1:3320/v1/dmap/users/alice"
        );
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from(["kvmesh-cli", "put", "users", "alice", "1", "--ttl-ms", "500"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Put { ttl_ms: Some(500), .. }
        ));

        let args = Args::try_parse_from(["kvmesh-cli", "scan", "users", "-p", "3", "--backup"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Scan { part_id: 3, backup: true, count: 100, .. }
        ));
    }
}
