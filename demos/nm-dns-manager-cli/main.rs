//! Minimal command-line harness for exercising the DNS resolution-plane
//! manager by hand: add an interface's DNS contribution, force an update
//! cycle, and dump the resulting observer property bag as JSON. Ambient
//! tooling only; it carries no invariants of its own.

use anyhow::Result;
use clap::{Parser, Subcommand};
use nm_dns_manager::entry::{IpConfigType, SourceTag};
use nm_dns_manager::family::FamilySelector;
use nm_dns_manager::snapshot::{IpConfigSnapshot, Ternary};
use nm_dns_manager::{DnsManager, DnsMode, RcManagerSetting, Settings};
use std::net::IpAddr;

#[derive(Parser)]
#[command(name = "nm-dns-manager-cli", about = "Exercise the DNS resolution-plane manager from the command line")]
struct Cli {
    #[arg(long, env = "NM_DNS_MODE", default_value = "default")]
    mode: String,
    #[arg(long, env = "NM_DNS_RC_MANAGER", default_value = "auto")]
    rc_manager: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add one interface's DNS contribution, run an update cycle, and dump
    /// the resulting observer property bag as JSON.
    Add {
        #[arg(long)]
        ifindex: i32,
        #[arg(long = "nameserver")]
        nameservers: Vec<IpAddr>,
        #[arg(long = "search")]
        search: Vec<String>,
        #[arg(long, default_value_t = 100)]
        priority: i32,
    },
    /// Dump the observer property bag as JSON with no changes applied.
    Dump,
}

#[tokio::main]
async fn main() -> Result<()> {
    nm_dns_manager::logging::init_tracing("info");
    let cli = Cli::parse();
    let settings = Settings::from_env(
        DnsMode::parse(&cli.mode),
        RcManagerSetting::parse(&cli.rc_manager),
    );
    let mut manager = DnsManager::new(settings);

    if let Command::Add { ifindex, nameservers, search, priority } = &cli.command {
        let snapshot = IpConfigSnapshot::new(
            *ifindex,
            None,
            nameservers.clone(),
            search.clone(),
            vec![],
            vec![],
            Ternary::Unset,
            *priority,
            false,
            vec![],
            vec![],
        );
        manager.set_ip_config(
            FamilySelector::Unspec,
            SourceTag(*ifindex as u64),
            Some(snapshot),
            IpConfigType::Default,
            false,
        )?;
    }

    let snapshot = manager.observer_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
