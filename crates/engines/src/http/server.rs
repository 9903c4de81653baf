//! Backend server process supervision and port acquisition.

use super::api::HttpApiClient;
use crate::error::{EngineError, Result};
use crate::process;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_util::sync::CancellationToken;

const KILL_GRACE: Duration = Duration::from_secs(5);

/// How `start()` should obtain a backend on the preferred port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPlan {
    /// A healthy backend already listens here; reuse it.
    Attach { port: u16 },
    /// The port is free (possibly after reclaiming an orphan); spawn.
    Spawn { port: u16 },
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Decide where the backend will live.
///
/// Preferred port free → spawn there. Occupied → probe it: a healthy
/// backend is attached to, any other listener makes us search the
/// surrounding range for a free port. Only when the whole range is taken do
/// we reclaim the preferred port from a presumed orphan.
pub async fn acquire_port(
    http: &reqwest::Client,
    preferred: u16,
    search_range: u16,
) -> Result<PortPlan> {
    if port_is_free(preferred) {
        return Ok(PortPlan::Spawn { port: preferred });
    }

    let probe_client = HttpApiClient::new(http.clone(), format!("http://127.0.0.1:{preferred}"));
    if probe_client.probe().await.is_ok() {
        tracing::info!(port = preferred, "attaching to running backend");
        return Ok(PortPlan::Attach { port: preferred });
    }

    for offset in 1..=search_range {
        for candidate in [preferred.checked_add(offset), preferred.checked_sub(offset)] {
            if let Some(port) = candidate.filter(|p| *p > 1024 && port_is_free(*p)) {
                tracing::info!(
                    preferred,
                    port,
                    "preferred port occupied by a foreign listener; using neighbour"
                );
                return Ok(PortPlan::Spawn { port });
            }
        }
    }

    // Whole range occupied: assume a crashed backend orphaned the port.
    tracing::warn!(port = preferred, "no free port in range; reclaiming preferred");
    process::reclaim_port(preferred).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    if port_is_free(preferred) {
        return Ok(PortPlan::Spawn { port: preferred });
    }
    Err(EngineError::Transport(format!(
        "no usable port near {preferred} (searched ±{search_range})"
    )))
}

/// A spawned backend process. Dropping the token kills it.
pub struct ManagedServer {
    pub base_url: String,
    pub port: u16,
}

/// Spawn the backend and wait until it announces its listening URL on
/// stdout (or the probe endpoint answers), within `start_timeout`.
///
/// The returned watcher future resolves when the process exits on its own;
/// cancelling `shutdown` terminates the process tree instead.
pub async fn spawn_server(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    port: u16,
    start_timeout: Duration,
    http: &reqwest::Client,
    shutdown: CancellationToken,
) -> Result<(ManagedServer, BoxFuture<'static, ()>)> {
    let args: Vec<String> = args
        .iter()
        .map(|a| a.replace("{port}", &port.to_string()))
        .collect();

    let mut cmd = process::backend_command(command, &args, env, None);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "backend stdout");
                if (line.contains("listening") || line.contains("http://"))
                    && let Some(tx) = ready_tx.take()
                {
                    let _ = tx.send(());
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(line = %line, "backend stderr");
            }
        });
    }

    let base_url = format!("http://127.0.0.1:{port}");

    // Marker first, probe as fallback; either means the server is up.
    let probe_client = HttpApiClient::new(http.clone(), base_url.clone());
    let started = Instant::now();
    let mut marker = Some(ready_rx);
    let up = loop {
        if started.elapsed() > start_timeout {
            break false;
        }
        if let Some(mut rx) = marker.take() {
            match tokio::time::timeout(Duration::from_millis(300), &mut rx).await {
                Ok(Ok(())) => break true,
                // Stdout closed without a marker; rely on probing alone.
                Ok(Err(_)) => {}
                Err(_) => marker = Some(rx),
            }
        } else {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if probe_client.probe().await.is_ok() {
            break true;
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(EngineError::Transport(format!(
                "backend exited during startup with {status}"
            )));
        }
    };
    if !up {
        process::terminate_tree(&mut child, KILL_GRACE).await;
        return Err(EngineError::Timeout(format!(
            "backend did not start listening within {}s",
            start_timeout.as_secs()
        )));
    }

    let watcher = Box::pin(async move {
        tokio::select! {
            () = shutdown.cancelled() => {
                process::terminate_tree(&mut child, KILL_GRACE).await;
            }
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::warn!(%status, "backend process exited"),
                    Err(e) => tracing::warn!(error = %e, "backend wait failed"),
                }
            }
        }
    });

    Ok((ManagedServer { base_url, port }, watcher))
}
