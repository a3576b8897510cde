//! Duplicate-instance guard.
//!
//! Two servers fighting over the boards and the TCS port helps nobody, so
//! startup scans the process table and refuses to run alongside another
//! instance.

#[derive(thiserror::Error, Debug)]
#[error(
    "another HIPSR server is already running as PID {pid} ({cmdline}).\n\
     Stop that process first, e.g.:  kill {pid}\n\
     Please check with other observers before killing it."
)]
pub struct DuplicateInstance {
    pub pid: u32,
    pub cmdline: String,
}

/// Name of the first cmdline argument, without its directory.
fn argv0_basename(cmdline: &str) -> &str {
    let argv0 = cmdline.split(['\0', ' ']).next().unwrap_or("");
    argv0.rsplit('/').next().unwrap_or(argv0)
}

fn find_duplicate<I>(procs: I, exe_name: &str, my_pid: u32) -> Option<(u32, String)>
where
    I: IntoIterator<Item = (u32, String)>,
{
    procs.into_iter().find(|(pid, cmdline)| {
        *pid != my_pid && argv0_basename(cmdline) == exe_name
    })
}

/// Enumerate running processes and fail if another server instance exists.
pub fn check_single_instance() -> Result<(), DuplicateInstance> {
    let exe_name = match std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
    {
        Some(name) => name,
        None => return Ok(()),
    };

    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        // no process table to scan; let the server start
        Err(_) => return Ok(()),
    };

    let procs = entries.filter_map(|entry| {
        let entry = entry.ok()?;
        let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
        let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
        let cmdline = String::from_utf8_lossy(&raw)
            .trim_end_matches('\0')
            .replace('\0', " ");
        Some((pid, cmdline))
    });

    match find_duplicate(procs, &exe_name, std::process::id()) {
        Some((pid, cmdline)) => Err(DuplicateInstance { pid, cmdline }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_other_instance_by_basename() {
        let procs = vec![
            (100, "/usr/bin/bash -l".to_string()),
            (200, "/opt/hipsr/bin/hipsr-server -d".to_string()),
            (300, "vim hipsr-server.log".to_string()),
        ];
        let hit = find_duplicate(procs, "hipsr-server", 42).unwrap();
        assert_eq!(hit.0, 200);
    }

    #[test]
    fn ignores_itself() {
        let procs = vec![(42, "/opt/hipsr/bin/hipsr-server -d".to_string())];
        assert!(find_duplicate(procs, "hipsr-server", 42).is_none());
    }

    #[test]
    fn current_process_is_not_a_duplicate() {
        // the test binary is not named hipsr-server, and even if it were,
        // its own pid is excluded
        assert!(check_single_instance().is_ok());
    }
}
