//! `tollgate serve`: Long-running admission service over stdin/stdout.
//!
//! Reads one JSON request per line and answers with one JSON line. The
//! ledger is flushed in the background on `budgets.flush_interval_secs`
//! and once more when stdin closes.
//!
//! ```text
//! {"op":"route","caller":"alice","channel":"slack","complexity":0.4}
//! {"op":"usage","reservation_id":"…","tokens_in":812,"tokens_out":240}
//! {"op":"release","reservation_id":"…"}
//! {"op":"tool","caller":"alice","channel":"slack","tool":"read_file"}
//! ```

use super::{Paths, Runtime, runtime};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tollgate_core::{Identity, ReservationId, RouteRequest};
use tollgate_router::AdmissionController;
use tollgate_security::ToolVerdict;
use tollgate_telemetry::{CostTracker, LedgerStore, flush, spawn_flush_task};
use tracing::{info, warn};

fn default_input_tokens() -> u32 {
    1000
}

/// One request line.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Route {
        caller: String,
        channel: String,
        complexity: f64,
        #[serde(default = "default_input_tokens")]
        input_tokens: u32,
        #[serde(default)]
        max_output: Option<u32>,
        #[serde(default)]
        model: Option<String>,
    },
    Usage {
        reservation_id: ReservationId,
        tokens_in: u32,
        tokens_out: u32,
    },
    Release {
        reservation_id: ReservationId,
    },
    Tool {
        caller: String,
        channel: String,
        tool: String,
    },
}

/// Answers request lines against one controller.
pub struct Server {
    controller: AdmissionController,
    /// Channels whose callers the upstream process has authenticated.
    trusted_channels: Vec<String>,
}

impl Server {
    pub fn new(controller: AdmissionController, trusted_channels: Vec<String>) -> Self {
        Self {
            controller,
            trusted_channels,
        }
    }

    /// Trust comes from the command line, never from the request line.
    fn identity(&self, caller: String, channel: String) -> Identity {
        if self.trusted_channels.contains(&channel) {
            Identity::trusted(caller, channel)
        } else {
            Identity::untrusted(caller, channel)
        }
    }

    pub fn handle_line(&self, line: &str) -> Value {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unreadable request line");
                return json!({ "ok": false, "kind": "bad_request", "error": e.to_string() });
            }
        };

        match request {
            Request::Route {
                caller,
                channel,
                complexity,
                input_tokens,
                max_output,
                model,
            } => {
                let mut request = RouteRequest::new(self.identity(caller, channel), complexity, input_tokens);
                if let Some(tokens) = max_output {
                    request = request.with_max_output(tokens);
                }
                if let Some(model) = model {
                    request = request.with_model(model);
                }
                match self.controller.route(&request) {
                    Ok(decision) => json!({ "ok": true, "decision": decision }),
                    Err(e) => json!({
                        "ok": false,
                        "kind": e.kind(),
                        "error": e.to_string(),
                        "retryable": e.is_retryable(),
                    }),
                }
            }
            Request::Usage {
                reservation_id,
                tokens_in,
                tokens_out,
            } => match self
                .controller
                .report_actual_usage(&reservation_id, tokens_in, tokens_out)
            {
                Some(cost) => json!({ "ok": true, "cost": cost }),
                None => json!({ "ok": false, "kind": "unknown_reservation" }),
            },
            Request::Release { reservation_id } => {
                json!({ "ok": self.controller.release(&reservation_id) })
            }
            Request::Tool { caller, channel, tool } => {
                match self.controller.authorize_tool(&self.identity(caller, channel), &tool) {
                    ToolVerdict::Allow => json!({ "ok": true, "allowed": true }),
                    ToolVerdict::Deny(reason) => json!({ "ok": true, "allowed": false, "reason": reason }),
                }
            }
        }
    }

    /// Answer every line of `reader` until EOF. Returns the number answered.
    pub async fn serve<R, W>(&self, reader: R, writer: &mut W) -> io::Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut answered = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply = self.handle_line(line);
            writer.write_all(format!("{reply}\n").as_bytes()).await?;
            writer.flush().await?;
            answered += 1;
        }
        Ok(answered)
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        self.controller.cost_tracker()
    }
}

/// Stop the background flusher and save whatever it has not.
async fn shutdown(
    flusher: Option<JoinHandle<()>>,
    tracker: &Arc<CostTracker>,
    store: Option<&Arc<dyn LedgerStore>>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(handle) = flusher {
        handle.abort();
    }
    if let Some(store) = store {
        flush(tracker, store).await?;
    }
    Ok(())
}

pub async fn run(paths: &Paths, trusted_channels: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let Runtime {
        config,
        controller,
        store,
    } = runtime(paths)?;
    let server = Server::new(controller, trusted_channels);

    let interval = Duration::from_secs(config.budgets.flush_interval_secs);
    let flusher = store
        .as_ref()
        .map(|store| spawn_flush_task(Arc::clone(server.cost_tracker()), Arc::clone(store), interval));

    info!(
        trusted = ?server.trusted_channels,
        persist = store.is_some(),
        flush_secs = interval.as_secs(),
        "Serving admission requests on stdin"
    );

    let mut stdout = io::stdout();
    let served = server.serve(BufReader::new(io::stdin()), &mut stdout).await;
    shutdown(flusher, server.cost_tracker(), store.as_ref()).await?;

    let answered = served?;
    info!(answered, pending = server.controller.outstanding(), "Input closed, stopped serving");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_config::AppConfig;
    use tollgate_core::{CapabilityOverride, PermissionLevel};
    use tollgate_telemetry::MemoryLedgerStore;

    fn server() -> Server {
        let mut config = AppConfig::default();
        config.permissions.users.insert(
            "alice".into(),
            CapabilityOverride {
                level: Some(PermissionLevel::Standard),
                tool_allow: Some(vec!["read_file".into()]),
                ..Default::default()
            },
        );
        Server::new(AdmissionController::from_config(&config, None), vec!["slack".into()])
    }

    #[test]
    fn route_then_report_usage() {
        let s = server();
        let reply = s.handle_line(r#"{"op":"route","caller":"alice","channel":"slack","complexity":0.2}"#);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["decision"]["tier"], "standard");
        let id = reply["decision"]["reservation_id"].as_str().unwrap().to_string();

        let line = format!(r#"{{"op":"usage","reservation_id":"{id}","tokens_in":500,"tokens_out":100}}"#);
        let reply = s.handle_line(&line);
        assert_eq!(reply["ok"], true);
        assert!(reply["cost"].as_f64().unwrap() > 0.0);

        let reply = s.handle_line(&line);
        assert_eq!(reply["kind"], "unknown_reservation");
        assert_eq!(s.controller.outstanding(), 0);
    }

    #[test]
    fn trust_comes_from_the_command_line() {
        let s = server();
        let on_web = s.handle_line(r#"{"op":"tool","caller":"alice","channel":"web","tool":"read_file"}"#);
        assert_eq!(on_web["allowed"], false);
        let on_slack = s.handle_line(r#"{"op":"tool","caller":"alice","channel":"slack","tool":"read_file"}"#);
        assert_eq!(on_slack["allowed"], true);

        let claimed = s.handle_line(r#"{"op":"tool","caller":"alice","channel":"web","tool":"read_file","trusted":true}"#);
        assert_eq!(claimed["allowed"], false);
    }

    #[test]
    fn refusals_and_bad_lines_are_answered() {
        let s = server();
        let reply = s.handle_line(r#"{"op":"route","caller":"mallory","channel":"web","complexity":0.9,"model":"anthropic/claude-opus-4"}"#);
        assert_eq!(reply["ok"], true, "override ignored without permission");
        assert_eq!(reply["decision"]["tier"], "free");

        let reply = s.handle_line("not json");
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["kind"], "bad_request");

        let id = reply_id(&s.handle_line(r#"{"op":"route","caller":"alice","channel":"slack","complexity":0.2}"#));
        let line = format!(r#"{{"op":"release","reservation_id":"{id}"}}"#);
        assert_eq!(s.handle_line(&line)["ok"], true);
        assert_eq!(s.handle_line(&line)["ok"], false);
    }

    fn reply_id(reply: &Value) -> String {
        reply["decision"]["reservation_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn serve_answers_each_line() {
        let s = server();
        let input = concat!(
            r#"{"op":"route","caller":"alice","channel":"slack","complexity":0.2}"#,
            "\n\n",
            r#"{"op":"tool","caller":"alice","channel":"slack","tool":"shell"}"#,
            "\n",
        );
        let mut out = Vec::new();
        let answered = s.serve(input.as_bytes(), &mut out).await.unwrap();
        assert_eq!(answered, 2);

        let replies: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["ok"], true);
        assert_eq!(replies[1]["allowed"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_flushes_while_serving_and_on_close() {
        let s = server();
        let memory = Arc::new(MemoryLedgerStore::new());
        let store: Arc<dyn LedgerStore> = memory.clone();
        let flusher = spawn_flush_task(Arc::clone(s.cost_tracker()), Arc::clone(&store), Duration::from_secs(5));

        let id = reply_id(&s.handle_line(r#"{"op":"route","caller":"alice","channel":"slack","complexity":0.2}"#));
        s.handle_line(&format!(
            r#"{{"op":"usage","reservation_id":"{id}","tokens_in":500,"tokens_out":100}}"#
        ));

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..100 {
            if memory.save_count() > 0 {
                break;
            }
            tokio::task::yield_now().await;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(memory.save_count(), 1);

        // Spend after the last tick is saved on shutdown.
        let id = reply_id(&s.handle_line(r#"{"op":"route","caller":"alice","channel":"slack","complexity":0.2}"#));
        s.handle_line(&format!(
            r#"{{"op":"usage","reservation_id":"{id}","tokens_in":500,"tokens_out":100}}"#
        ));
        shutdown(Some(flusher), s.cost_tracker(), Some(&store)).await.unwrap();
        assert_eq!(memory.save_count(), 2);
        let saved = memory.load().unwrap().unwrap();
        assert!(saved.identities.contains_key("slack:alice"));
    }
}
