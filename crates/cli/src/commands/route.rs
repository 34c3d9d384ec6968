//! `tollgate route`: Dry-run one admission decision.

use super::{Paths, runtime};
use tollgate_core::{Identity, RouteRequest};

pub struct RouteArgs {
    pub complexity: f64,
    pub input_tokens: u32,
    pub max_output: Option<u32>,
    pub model: Option<String>,
    pub settle_output: Option<u32>,
}

pub async fn run(paths: &Paths, identity: Identity, args: RouteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime(paths)?;

    let mut request = RouteRequest::new(identity, args.complexity, args.input_tokens);
    if let Some(tokens) = args.max_output {
        request = request.with_max_output(tokens);
    }
    if let Some(model) = args.model {
        request = request.with_model(model);
    }

    let decision = match rt.controller.route(&request) {
        Ok(decision) => decision,
        Err(e) => {
            println!("❌ {} ({})", e, e.kind());
            if e.is_retryable() {
                println!("   Retryable later.");
            }
            return Err(e.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&decision)?);

    let Some(output_tokens) = args.settle_output else {
        rt.controller.release(&decision.reservation_id);
        return Ok(());
    };

    match rt
        .controller
        .report_actual_usage(&decision.reservation_id, args.input_tokens, output_tokens)
    {
        Some(actual) => println!("💵 Settled at ${actual:.6} (estimated ${:.6})", decision.cost_estimate),
        None => println!("⚠️  Reservation {} was already settled", decision.reservation_id),
    }

    if let Some(store) = &rt.store {
        tollgate_telemetry::flush(rt.controller.cost_tracker(), store).await?;
        println!("   Ledger saved to {}", rt.config.budgets.ledger_path().display());
    }
    Ok(())
}
