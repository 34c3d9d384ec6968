//! `tollgate usage`: Show spend recorded in the persisted ledger.

use super::{Paths, runtime};
use chrono::Utc;
use tollgate_core::Identity;
use tollgate_telemetry::{PeriodUsage, UsageSnapshot};

pub async fn run(paths: &Paths, caller: Option<String>, channel: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime(paths)?;
    if rt.store.is_none() {
        println!("⚠️  Ledger persistence is disabled (budgets.persist = false); nothing to show.");
        return Ok(());
    }
    let tracker = rt.controller.cost_tracker();

    println!("📊 Ledger Usage ({})", rt.config.budgets.ledger_path().display());
    println!("─────────────────────────────────────────────────────");
    print_snapshot(&tracker.global_usage());

    match caller {
        Some(caller) => {
            // Limits shown are those a trusted caller on this channel would get.
            let identity = Identity::trusted(caller, channel);
            let caps = rt.controller.capabilities_for(&identity);
            print_snapshot(&tracker.usage(&identity, &caps));
        }
        None => {
            let now = Utc::now();
            let keys = tracker.identities();
            for key in &keys {
                print_snapshot(&tracker.usage_by_key(key, 0.0, 0.0, now));
            }
            println!();
            println!("  {} identities tracked", keys.len());
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &UsageSnapshot) {
    println!("  {}", snapshot.key);
    println!("    Daily:   {}", describe(&snapshot.daily));
    println!("    Monthly: {}", describe(&snapshot.monthly));
}

fn describe(period: &PeriodUsage) -> String {
    match period.remaining() {
        Some(remaining) => format!(
            "${:.4} spent / ${:.4} limit (${:.4} remaining)",
            period.spent, period.limit, remaining
        ),
        None => format!("${:.4} spent (unlimited)", period.spent),
    }
}
