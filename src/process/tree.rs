//! Process-tree discovery and platform kill helpers.
//!
//! Descendants are found by walking parent-PID lineage from a process table
//! snapshot, so children that left the root's process group are still found.

use std::collections::{HashMap, VecDeque};

use sysinfo::{Pid, ProcessStatus, System};

/// All live descendants of `root`, deepest first.
///
/// Killing in this order means a parent never gets the chance to respawn or
/// orphan a child that is still on the list.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            continue;
        }
        if let Some(parent) = process.parent() {
            children
                .entry(parent.as_u32())
                .or_default()
                .push(pid.as_u32());
        }
    }

    // Breadth-first, then reversed: every child lands after its parent, so the
    // reverse puts leaves before their ancestors.
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !order.contains(&kid) {
                    order.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    order.reverse();
    order
}

/// Send a kill to each pid in order. Pids that already exited are skipped.
pub fn kill_pids(pids: &[u32]) -> usize {
    if pids.is_empty() {
        return 0;
    }
    let mut system = System::new();
    system.refresh_processes();

    let mut killed = 0;
    for &pid in pids {
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            if process.kill() {
                killed += 1;
            } else {
                tracing::debug!(pid, "kill signal not delivered");
            }
        }
    }
    killed
}

/// Whether `pid` refers to a running (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .unwrap_or(false)
}

/// Last-resort termination through the platform's own tree kill.
#[cfg(unix)]
pub fn escalate(pid: u32) {
    tracing::warn!(pid, "Escalating to SIGKILL on process group");
    kill_group(pid);
    if let Ok(pid) = i32::try_from(pid) {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
pub fn escalate(pid: u32) {
    tracing::warn!(pid, "Escalating to taskkill /F /T");
    kill_group(pid);
}

/// SIGKILL every remaining member of the process group `pgid`.
///
/// The supervised root leads its own group, so the group id is the root's
/// pid. The group outlives the root while any member is alive, which makes
/// this the way to reach background children after the root was reaped.
/// Returns whether any member was signalled.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> bool {
    // Zero or out-of-range ids would address our own group or every process.
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    rc == 0
}

#[cfg(windows)]
pub fn kill_group(pid: u32) -> bool {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let result = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output();
    match result {
        Ok(output) if !output.status.success() => {
            tracing::debug!(
                "taskkill stderr: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            false
        }
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Failed to run taskkill: {}", e);
            false
        }
    }
}
