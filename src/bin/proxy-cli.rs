use clap::{Parser, Subcommand};
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Admin CLI for the replay proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8055")]
    url: String,

    /// Recorded in the audit log as the author of mode changes
    #[arg(long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show mode, overrides and cache counts
    Status,
    /// Switch the global mode (replay, record, live, hybrid)
    Mode { mode: String },
    /// Override the mode for one domain
    DomainMode { domain: String, mode: String },
    /// Remove a domain override
    ClearDomainMode { domain: String },
    /// Turn replay-miss fallback on or off
    Hybrid {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Inspect or clear the recorded cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show recent mode changes
    Audit,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List recorded domains, or the keys of one domain
    List { domain: Option<String> },
    /// Clear everything, or one domain
    Clear { domain: Option<String> },
}

struct Admin {
    client: reqwest::Client,
    base: String,
    user: Option<String>,
}

impl Admin {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base.trim_end_matches('/'), path));
        match &self.user {
            Some(user) => builder.header("x-proxy-user", user),
            None => builder,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    // The admin API lives on the proxy port; never route it through a proxy.
    let client = reqwest::Client::builder().no_proxy().build()?;
    let admin = Admin {
        client,
        base: cli.url,
        user: cli.user,
    };

    let request = match cli.command {
        Commands::Status => admin.request(Method::GET, "/admin/status"),
        Commands::Mode { mode } => admin.request(Method::POST, &format!("/admin/mode/{mode}")),
        Commands::DomainMode { domain, mode } => {
            admin.request(Method::PUT, &format!("/admin/domains/{domain}/mode/{mode}"))
        }
        Commands::ClearDomainMode { domain } => {
            admin.request(Method::DELETE, &format!("/admin/domains/{domain}/mode"))
        }
        Commands::Hybrid { enabled } => admin
            .request(Method::POST, "/admin/hybrid")
            .json(&json!({ "enabled": enabled })),
        Commands::Cache { action } => match action {
            CacheAction::List { domain: None } => admin.request(Method::GET, "/admin/cache"),
            CacheAction::List { domain: Some(d) } => {
                admin.request(Method::GET, &format!("/admin/cache/{d}"))
            }
            CacheAction::Clear { domain: None } => admin.request(Method::DELETE, "/admin/cache"),
            CacheAction::Clear { domain: Some(d) } => {
                admin.request(Method::DELETE, &format!("/admin/cache/{d}"))
            }
        },
        Commands::Audit => admin.request(Method::GET, "/admin/audit"),
    };

    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let rendered = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        eprintln!("{rendered}");
        std::process::exit(1);
    }
    println!("{rendered}");
    Ok(())
}
