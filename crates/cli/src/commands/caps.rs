//! `tollgate caps`: Show a caller's resolved capability record.

use super::{Paths, runtime};
use tollgate_core::Identity;

pub async fn run(paths: &Paths, identity: Identity) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime(paths)?;
    let caps = rt.controller.capabilities_for(&identity);

    println!("🔑 {identity} ({})", if identity.is_trusted() { "trusted" } else { "untrusted" });
    println!("{}", serde_json::to_string_pretty(&caps)?);
    Ok(())
}
