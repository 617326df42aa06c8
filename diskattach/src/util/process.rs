//! Process validation utilities for PID checking and verification.

use std::path::Path;

/// Terminate a process with SIGTERM.
///
/// # Returns
/// * `true` - Signal delivered or process doesn't exist
/// * `false` - Failed to signal (permission denied)
pub fn terminate_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 || !is_process_alive(pid) }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
///
/// # Returns
/// * `true` - Process exists
/// * `false` - Process does not exist or permission denied
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Read the argument vector of a process from `<proc_root>/<pid>/cmdline`.
pub fn read_cmdline(proc_root: &Path, pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(proc_root.join(pid.to_string()).join("cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect(),
    )
}

/// Verify that a PID belongs to `program` and that its command line mentions
/// every string in `needles`.
///
/// This prevents PID reuse from being mistaken for a live export server.
pub fn is_same_process(proc_root: &Path, pid: u32, program: &str, needles: &[&str]) -> bool {
    match read_cmdline(proc_root, pid) {
        Some(args) => {
            let is_program = args.first().is_some_and(|arg0| {
                Path::new(arg0)
                    .file_name()
                    .is_some_and(|name| name == program)
            });
            is_program && needles.iter().all(|n| args.iter().any(|a| a.contains(n)))
        }
        None => false,
    }
}

/// Find every process running `program` whose command line mentions `needle`.
///
/// Returns each match's PID with its full argument vector.
pub fn find_processes(proc_root: &Path, program: &str, needle: &str) -> Vec<(u32, Vec<String>)> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut found: Vec<(u32, Vec<String>)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| is_same_process(proc_root, *pid, program, &[needle]))
        .filter_map(|pid| read_cmdline(proc_root, pid).map(|args| (pid, args)))
        .collect();
    found.sort_by_key(|(pid, _)| *pid);
    found
}
