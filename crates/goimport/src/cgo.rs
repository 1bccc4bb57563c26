use loupe_store::EnvMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ImportError, Result};

const POLL: Duration = Duration::from_millis(10);

/// Asks the go tool for the compiled archive of the package in `dir`.
///
/// The command runs with exactly the agent's environment and is killed when
/// `cancel` fires. Its single line of output is the archive path.
pub fn export_archive(
    go: &Path,
    dir: &Path,
    env: &EnvMap,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let title = format!(
        "Kim-Porter: importCgoPkg(go list -e -export -f={{{{.Export}}}} {})",
        dir.display()
    );
    let fail = |err: String| ImportError::Cgo(format!("{title}: {err}"));

    let mut child = Command::new(go)
        .args(["list", "-e", "-export", "-f={{.Export}}", "."])
        .current_dir(dir)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| fail(e.to_string()))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out = std::thread::spawn(move || drain(stdout));
    let errout = std::thread::spawn(move || drain(stderr));

    let status = loop {
        if cancel.is_cancelled() {
            log::debug!("{title}: cancelled");
            let _ = child.kill();
            let _ = child.wait();
            return Err(fail("cancelled".to_string()));
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(POLL),
            Err(e) => return Err(fail(e.to_string())),
        }
    };
    let out = out.join().unwrap_or_default();
    let errout = errout.join().unwrap_or_default();
    if !status.success() {
        let msg = errout.trim();
        return Err(fail(if msg.is_empty() {
            status.to_string()
        } else {
            msg.to_string()
        }));
    }
    let path = out.trim();
    if path.is_empty() {
        return Err(fail("no export data".to_string()));
    }
    Ok(PathBuf::from(path))
}

fn drain(r: Option<impl Read>) -> String {
    let mut s = String::new();
    if let Some(mut r) = r {
        let _ = r.read_to_string(&mut s);
    }
    s
}

/// The go binary under GOROOT, or `go` from PATH.
pub fn go_tool(goroot: &Path) -> PathBuf {
    let exe = if cfg!(windows) { "go.exe" } else { "go" };
    let p = goroot.join("bin").join(exe);
    if p.is_file() {
        p
    } else {
        PathBuf::from(exe)
    }
}
