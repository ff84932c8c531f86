use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tracing::debug;

/// Place a command in its own process group so the engine can terminate the
/// whole tree, not just the direct child.
pub fn set_process_group(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid as i32), signal);
}

/// TERM the child's process group, wait out the grace period, then KILL
/// anything still alive. Used on cancellation and stage timeout.
pub async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    {
        debug!(pid, "terminating process group");
        signal_group(pid, nix::sys::signal::Signal::SIGTERM);
        let graceful = tokio::time::timeout(grace, child.wait()).await.is_ok();
        if !graceful {
            signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
        let _ = tokio::time::timeout(grace, child.wait()).await;
    }
}

/// Whether a process exists and is not a zombie. EPERM still counts as
/// alive; we only need existence, not the right to signal.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid_zombie(pid) {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn pid_zombie(pid: u32) -> bool {
    let stat_path = format!("/proc/{pid}/stat");
    let Ok(line) = std::fs::read_to_string(&stat_path) else {
        return false;
    };
    // State is the first field after the parenthesized command name.
    let Some(close_idx) = line.rfind(')') else {
        return false;
    };
    matches!(
        line[close_idx + 1..].trim_start().chars().next(),
        Some('Z') | Some('X')
    )
}

/// Argv of a live process, used for the stop identity check.
pub fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).to_string())
        .collect();
    if args.is_empty() { None } else { Some(args) }
}

/// Verify the pid recorded in `run.pid` still belongs to an attractor run
/// for this logs root before signaling it. A recycled pid must never be
/// killed.
pub fn verify_run_identity(pid: u32, logs_root: &Path, run_id: &str) -> bool {
    let Some(argv) = read_cmdline(pid) else {
        // No procfs: refuse rather than signal an unverified process.
        return false;
    };
    let logs_root = logs_root.display().to_string();
    let mentions_target = argv
        .iter()
        .any(|arg| arg == &logs_root || (!run_id.is_empty() && arg == run_id));
    let looks_like_engine = argv
        .iter()
        .any(|arg| arg.contains("attractor") || arg == "run" || arg == "resume");
    mentions_target && looks_like_engine
}

#[cfg(unix)]
pub fn signal_pid_group(pid: u32, force: bool) {
    use nix::sys::signal::Signal;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    signal_group(pid, signal);
    // Session leaders launched detached may not share our group hierarchy;
    // signal the pid directly as well.
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), signal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_alive_self_expected_true() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn pid_alive_zero_expected_false() {
        assert!(!pid_alive(0));
    }

    #[test]
    fn read_cmdline_self_expected_some_args() {
        if !Path::new("/proc/self/stat").exists() {
            return;
        }
        let argv = read_cmdline(std::process::id()).expect("own cmdline should read");
        assert!(!argv.is_empty());
    }

    #[test]
    fn verify_run_identity_mismatched_argv_expected_false() {
        if !Path::new("/proc/self/stat").exists() {
            return;
        }
        // Our own argv is a test binary, not an attractor run for this root.
        assert!(!verify_run_identity(
            std::process::id(),
            Path::new("/nonexistent/logs"),
            "no-such-run"
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn terminate_process_group_expected_child_exits() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30");
        set_process_group(&mut cmd);
        let Ok(mut child) = cmd.spawn() else {
            return; // no sleep binary
        };

        terminate_process_group(&mut child, Duration::from_millis(500)).await;
        let status = child.wait().await.expect("wait should succeed");
        assert!(!status.success());
    }
}
