//! Shared child-process plumbing for adapters that supervise a backend.

use std::collections::HashMap;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Build a backend command with the gateway's standard environment hygiene:
/// the parent environment minus `ELECTRON_RUN_AS_NODE`, with git credential
/// prompts disabled so a backend never blocks on interactive auth.
///
/// Callers configure stdio themselves; `kill_on_drop` is always set so a
/// dropped adapter cannot leak its child.
#[must_use]
pub fn backend_command(
    program: &str,
    args: &[String],
    extra_env: &HashMap<String, String>,
    cwd: Option<&str>,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.env_remove("ELECTRON_RUN_AS_NODE");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_ASKPASS", "");
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.kill_on_drop(true);
    cmd
}

/// Terminate a backend process and everything it spawned.
///
/// Unix: SIGTERM, wait out the grace period, then SIGKILL. Windows: shell
/// launchers do not propagate signals, so kill the whole tree with
/// `taskkill /T /F`.
pub async fn terminate_tree(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::debug!(pid, "backend ignored SIGTERM; killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    #[cfg(windows)]
    {
        let _ = grace;
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .status()
            .await;
        let _ = child.wait().await;
    }
}

/// Free a TCP port orphaned by a crashed backend, best-effort.
pub async fn reclaim_port(port: u16) {
    #[cfg(unix)]
    {
        let _ = Command::new("fuser")
            .args(["-k", &format!("{port}/tcp")])
            .status()
            .await;
    }

    #[cfg(windows)]
    {
        let script = format!(
            "Get-NetTCPConnection -LocalPort {port} -ErrorAction SilentlyContinue | \
             ForEach-Object {{ Stop-Process -Id $_.OwningProcess -Force }}"
        );
        let _ = Command::new("powershell")
            .args(["-NoProfile", "-Command", &script])
            .status()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn backend_command_scrubs_environment() {
        let cmd = backend_command("true", &[], &HashMap::new(), None);
        let envs: Vec<(&OsStr, Option<&OsStr>)> = cmd.as_std().get_envs().collect();

        let get = |name: &str| {
            envs.iter()
                .find(|(k, _)| *k == OsStr::new(name))
                .map(|(_, v)| *v)
        };
        assert_eq!(get("ELECTRON_RUN_AS_NODE"), Some(None), "removed, not inherited");
        assert_eq!(
            get("GIT_TERMINAL_PROMPT").flatten(),
            Some(OsStr::new("0"))
        );
        assert_eq!(get("GIT_ASKPASS").flatten(), Some(OsStr::new("")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_tree_reaps_a_sleeping_child() {
        let mut child = backend_command("sleep", &["30".to_string()], &HashMap::new(), None)
            .stdout(std::process::Stdio::null())
            .spawn()
            .expect("spawn sleep");
        terminate_tree(&mut child, Duration::from_secs(2)).await;
        // wait() after termination must not hang.
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
    }
}
