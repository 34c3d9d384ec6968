//! `tollgate tool`: Check a tool invocation.

use super::{Paths, runtime};
use tollgate_core::Identity;
use tollgate_security::ToolVerdict;

pub async fn run(paths: &Paths, identity: Identity, tool_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rt = runtime(paths)?;
    match rt.controller.authorize_tool(&identity, tool_name) {
        ToolVerdict::Allow => println!("✅ {identity} may use '{tool_name}'"),
        ToolVerdict::Deny(reason) => println!("⛔ {identity} may not use '{tool_name}': {reason}"),
    }
    Ok(())
}
