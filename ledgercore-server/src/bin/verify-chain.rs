//! Standalone chain-verification tool, grounded on the teacher's
//! `bin/verify-ledger.rs`: connect directly to Postgres, recompute the hash
//! chain for one tenant (or every tenant), and print a report — no HTTP
//! round trip, for operators auditing a ledger offline.
//!
//! Usage: `verify-chain [--tenant T1] [--repair]`

use clap::Parser;
use ledgercore_anchor::postgres::PgAnchorStore;
use ledgercore_core::PgTenantStore;
use ledgercore_ledger::postgres::PgLedger;
use ledgercore_ledger::{ChainVerification, Ledger, TenantId};
use sqlx::PgPool;

#[derive(Parser)]
#[command(about = "Verify the hash chain of one or all tenants' ledgers")]
struct Args {
    /// Verify only this tenant; otherwise every active tenant is checked.
    #[arg(long)]
    tenant: Option<String>,

    /// If a break is found, mark the tenant's ledger quarantined.
    #[arg(long)]
    repair: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://ledgercore@localhost:5432/ledgercore_dev".to_string());

    println!("connecting to {database_url}");
    let pool = PgPool::connect(&database_url).await?;
    println!("connected");

    let ledger = PgLedger::new(pool.clone());
    let anchors = PgAnchorStore::new(pool.clone());
    let tenants = PgTenantStore::new(pool.clone());

    let tenant_ids = match args.tenant {
        Some(id) => vec![TenantId(id)],
        None => {
            use ledgercore_core::TenantStore;
            tenants.list_active().await?.into_iter().map(|t| t.id).collect()
        }
    };

    let mut any_invalid = false;
    for tenant in &tenant_ids {
        let result: ChainVerification = ledger.verify_chain(tenant, None, None).await?;
        if result.valid {
            let last_anchor = anchors.last_anchor(tenant).await?;
            let anchored_to = last_anchor.map(|a| a.end_sequence).unwrap_or(0);
            println!("{tenant}: OK (anchored through sequence {anchored_to})");
        } else {
            any_invalid = true;
            println!("{tenant}: CORRUPT at sequence {:?}", result.first_corruption);
            if args.repair {
                ledger.quarantine(tenant).await?;
                println!("{tenant}: quarantined");
            }
        }
    }

    if any_invalid {
        std::process::exit(1);
    }
    Ok(())
}
