//! The stdio adapter: spawns `template.command`, frames JSON-RPC over
//! newline-delimited stdout/stdin, and drains stderr so the pipe buffer
//! never backs up and stalls the child.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::envinject::build_child_env;
use crate::error::{GatewayError, GatewayResult};
use crate::jsonrpc::{parse_frame, serialize_frame, JsonRpcRequest, JsonRpcResponse};
use crate::model::Template;

use super::{connection_closed, env_hint_pattern, generate_request_id, AdapterEvent, PendingCalls, TransportAdapter};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Owns the running child for as long as it lives. A single task drives
/// this to completion either way: the child exits on its own (a crash) or
/// `disconnect` asks it to stop. Either path ends the same way — kill the
/// pipe, fail every pending call, and emit one `Disconnect` event — so
/// callers can't tell a requested shutdown from a crash except by the exit
/// code carried on that event.
struct Supervisor {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct StdioAdapter {
    stdin: Mutex<Option<ChildStdin>>,
    supervisor: Mutex<Option<Supervisor>>,
    pending: Arc<PendingCalls>,
    events: broadcast::Sender<AdapterEvent>,
    connected: Arc<AtomicBool>,
    pid: Arc<parking_lot::Mutex<Option<u32>>>,
}

impl Default for StdioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioAdapter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stdin: Mutex::new(None),
            supervisor: Mutex::new(None),
            pending: Arc::new(PendingCalls::new()),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            pid: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    async fn handshake(&self, template: &Template) -> GatewayResult<()> {
        let request = JsonRpcRequest::new(
            "initialize",
            Some(json!({
                "protocolVersion": template.protocol_version,
                "capabilities": {},
                "clientInfo": {"name": "gateway", "version": env!("CARGO_PKG_VERSION")},
            })),
        )
        .with_id(json!(0));

        let response = self.send_and_receive(request, template.timeout_ms).await?;
        if let Some(error) = &response.error {
            return Err(GatewayError::ConnectionClosed(format!(
                "handshake rejected: {}",
                error.message
            )));
        }
        if response
            .result
            .as_ref()
            .and_then(|r| r.get("protocolVersion"))
            .is_none()
        {
            tracing::warn!("initialize response carried no protocolVersion");
        }

        let initialized = JsonRpcRequest::new("notifications/initialized", None);
        self.send(initialized).await
    }
}

/// Drives one child process for its whole life. Whichever branch fires
/// first — the child exiting unprompted, or a shutdown request — reaps it,
/// marks the adapter disconnected, fails every pending call, and emits
/// exactly one `Disconnect` event carrying the exit code.
async fn run_supervisor(
    mut child: Child,
    shutdown_rx: oneshot::Receiver<()>,
    pending: Arc<PendingCalls>,
    events: broadcast::Sender<AdapterEvent>,
    connected: Arc<AtomicBool>,
    pid: Arc<parking_lot::Mutex<Option<u32>>>,
) {
    let (code, signal, reason) = tokio::select! {
        status = child.wait() => {
            (status.ok().and_then(|s| s.code()), None, "back end exited unexpectedly")
        }
        _ = shutdown_rx => {
            if let Some(pid) = child.id() {
                unsafe_send_sigterm(pid);
            }
            match tokio::time::timeout(GRACEFUL_SHUTDOWN, child.wait()).await {
                Ok(Ok(status)) => (status.code(), None, "disconnect"),
                _ => {
                    let _ = child.kill().await;
                    let status = child.wait().await.ok();
                    (status.and_then(|s| s.code()), Some(9), "disconnect")
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    *pid.lock() = None;
    pending.fail_all(reason);
    let _ = events.send(AdapterEvent::Disconnect { code, signal });
}

#[async_trait]
impl TransportAdapter for StdioAdapter {
    async fn connect(&self, template: &Template) -> GatewayResult<()> {
        let command = template
            .command
            .as_ref()
            .ok_or_else(|| GatewayError::BadInput("stdio template missing command".into()))?;

        let mut cmd = Command::new(command);
        cmd.args(&template.args)
            .envs(build_child_env(&template.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &template.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        self.connected.store(true, Ordering::SeqCst);
        *self.pid.lock() = child.id();

        let pending = self.pending.clone();
        let events_tx = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        match parse_frame(&line) {
                            Ok(value) => {
                                if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
                                    pending.resolve(response.clone());
                                    let _ = events_tx.send(AdapterEvent::Received(response));
                                }
                            }
                            Err(err) => {
                                tracing::warn!(%err, line, "discarding malformed JSON-RPC frame");
                            }
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%err, "stdout read error");
                        break;
                    }
                }
            }
        });

        let events_tx = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(caps) = env_hint_pattern().captures(&line) {
                    let _ = events_tx.send(AdapterEvent::EnvHint(format!(
                        "env-hint: {}",
                        caps.get(0).map(|m| m.as_str()).unwrap_or(&line)
                    )));
                }
                let _ = events_tx.send(AdapterEvent::Stderr(line));
            }
        });

        *self.stdin.lock().await = Some(stdin);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_supervisor(
            child,
            shutdown_rx,
            self.pending.clone(),
            self.events.clone(),
            self.connected.clone(),
            self.pid.clone(),
        ));
        *self.supervisor.lock().await = Some(Supervisor {
            shutdown_tx: Some(shutdown_tx),
            handle,
        });

        self.handshake(template).await
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        let Some(mut supervisor) = self.supervisor.lock().await.take() else {
            return Ok(());
        };
        if let Some(tx) = supervisor.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = supervisor.handle.await;
        Ok(())
    }

    async fn send(&self, msg: JsonRpcRequest) -> GatewayResult<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected("stdio adapter not connected".into()));
        }

        let frame = serialize_frame(&msg)?;
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(GatewayError::NotConnected("stdio adapter not connected".into()));
        };
        stdin.write_all(frame.as_bytes()).await.map_err(GatewayError::Io)?;
        let _ = self.events.send(AdapterEvent::Sent(msg));
        Ok(())
    }

    async fn send_and_receive(&self, mut msg: JsonRpcRequest, timeout_ms: u64) -> GatewayResult<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected("stdio adapter not connected".into()));
        }

        let id = match &msg.id {
            Some(id) => id.clone(),
            None => {
                let generated: Value = json!(generate_request_id(crate::model::now_ms()));
                msg.id = Some(generated.clone());
                generated
            }
        };

        let rx = self.pending.register(id.clone());
        self.send(msg).await?;

        if timeout_ms == 0 {
            return rx.await.map_err(|_| connection_closed(&id));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(connection_closed(&id)),
            Err(_) => {
                self.pending.cancel(&id);
                Err(GatewayError::RequestTimeout(format!("request timeout for message {id}")))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }
}

#[cfg(unix)]
fn unsafe_send_sigterm(pid: u32) {
    // SAFETY: `kill` with a valid pid and SIGTERM is always safe to call;
    // an already-exited pid simply yields ESRCH, which we ignore.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn unsafe_send_sigterm(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtocolVersion, Transport};
    use std::collections::HashMap;

    fn echo_template(script: &str, timeout_ms: u64) -> Template {
        Template {
            name: "echo".into(),
            protocol_version: ProtocolVersion::V2025_06_18,
            transport: Transport::Stdio,
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            working_directory: None,
            endpoint: None,
            timeout_ms,
            retries: 0,
            container: None,
            health_check: None,
            untrusted: false,
        }
    }

    #[tokio::test]
    async fn send_and_receive_matches_replied_id() {
        // A tiny shell script that answers "initialize" then any request
        // with its own id reflected back in the result.
        let script = r#"
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  method=$(echo "$line" | sed -n 's/.*"method":"\([a-zA-Z/]*\)".*/\1/p')
  if [ "$method" = "initialize" ]; then
    echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-06-18\"}}"
  elif [ -n "$id" ]; then
    echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"ok\":true}}"
  fi
done
"#;
        let adapter = StdioAdapter::new();
        let template = echo_template(script, 2000);
        adapter.connect(&template).await.unwrap();

        let response = adapter
            .send_and_receive(JsonRpcRequest::new("ping", None).with_id(json!(7)), 2000)
            .await
            .unwrap();
        assert_eq!(response.id, json!(7));

        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn pid_is_set_while_connected_and_cleared_after_disconnect() {
        let adapter = StdioAdapter::new();
        let template = echo_template("while IFS= read -r line; do :; done", 100);
        assert!(adapter.pid().is_none());
        let _ = adapter.connect(&template).await;
        assert!(adapter.pid().is_some());
        adapter.disconnect().await.unwrap();
        assert!(adapter.pid().is_none());
    }

    #[tokio::test]
    async fn send_and_receive_times_out_when_back_end_is_silent() {
        let adapter = StdioAdapter::new();
        let template = echo_template("while IFS= read -r line; do :; done", 50);
        // The handshake itself will time out against this back end; that's
        // fine, we only care that a post-connect call also times out cleanly.
        let _ = adapter.connect(&template).await;

        let result = adapter
            .send_and_receive(JsonRpcRequest::new("ping", None).with_id(json!(2)), 50)
            .await;
        assert!(matches!(result, Err(GatewayError::RequestTimeout(_))));
        assert_eq!(adapter.pending.len(), 0);
        adapter.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_exit_fails_pending_calls_and_emits_disconnect_with_exit_code() {
        // The handshake itself replies once, then the child exits with
        // code 1 the moment it sees a second request.
        let script = r#"
read -r line
id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-06-18\"}}"
read -r line
exit 1
"#;
        let adapter = StdioAdapter::new();
        let template = echo_template(script, 2000);
        adapter.connect(&template).await.unwrap();

        let mut events = adapter.subscribe();
        let result = adapter
            .send_and_receive(JsonRpcRequest::new("ping", None).with_id(json!(9)), 2000)
            .await;
        assert!(matches!(result, Err(GatewayError::ConnectionClosed(_))));
        assert!(!adapter.is_connected());

        let mut saw_crash_disconnect = false;
        while let Ok(event) = events.recv().await {
            if let AdapterEvent::Disconnect { code, .. } = event {
                assert_eq!(code, Some(1));
                saw_crash_disconnect = true;
                break;
            }
        }
        assert!(saw_crash_disconnect);
    }

    #[tokio::test]
    async fn send_after_crash_is_not_connected_not_a_raw_io_error() {
        let script = r#"
read -r line
id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-06-18\"}}"
exit 1
"#;
        let adapter = StdioAdapter::new();
        let template = echo_template(script, 2000);
        adapter.connect(&template).await.unwrap();

        // Give the supervisor a moment to observe the exit and flip
        // `connected` to false before attempting another send.
        for _ in 0..20 {
            if !adapter.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!adapter.is_connected());

        let result = adapter.send(JsonRpcRequest::new("ping", None).with_id(json!(3))).await;
        assert!(matches!(result, Err(GatewayError::NotConnected(_))));
    }
}
