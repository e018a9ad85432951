//! Killing a run and everything it spawned
//!
//! Native runs get their own process group and carry a run marker in their
//! environment. Killing a run signals the group, then sweeps `/proc` for
//! processes that left the group (`setsid`, double fork) but still descend
//! from the program or inherited the marker.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable tagging every process of a native run
pub(crate) const RUN_MARKER_VAR: &str = "CODERUN_RUN";

/// Sweep rounds before giving up on a process tree that keeps forking
const SWEEP_ROUNDS: usize = 8;
const SWEEP_PAUSE: Duration = Duration::from_millis(10);

/// What has to be killed to stop a run
#[derive(Debug, Clone)]
pub(crate) struct KillTarget {
    /// Process group of the spawned child (its own pid)
    pub(crate) pgid: Option<u32>,
    /// `CODERUN_RUN=<id>` entry for native runs
    pub(crate) marker: Option<String>,
    /// Container CLI and container name for isolated runs
    pub(crate) container: Option<(&'static str, String)>,
}

impl KillTarget {
    /// SIGKILL the process group and stray descendants, then the container
    ///
    /// Safe to call repeatedly and after the process has exited.
    pub(crate) async fn kill(&self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }

        if let Some(marker) = &self.marker {
            for _ in 0..SWEEP_ROUNDS {
                if sweep(self.pgid, marker) == 0 {
                    break;
                }
                tokio::time::sleep(SWEEP_PAUSE).await;
            }
        }

        if let Some((cli, name)) = &self.container {
            match tokio::process::Command::new(cli)
                .args(["kill", name.as_str()])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .await
            {
                Ok(status) => debug!(container = %name, ?status, "container kill issued"),
                Err(e) => warn!(container = %name, error = %e, "container kill failed"),
            }
        }
    }
}

/// SIGKILL every process in the group; a vanished group is not an error
pub(crate) fn kill_group(pgid: u32) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "process group killed"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "killpg failed"),
    }
}

/// One pass over `/proc`: SIGKILL every live process of the run
///
/// Returns how many processes were signalled.
fn sweep(root: Option<u32>, marker: &str) -> usize {
    let table = process_table();
    let victims = run_members(&table, root, marker.as_bytes(), std::process::id());
    for pid in &victims {
        let Ok(raw) = i32::try_from(*pid) else {
            continue;
        };
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "stray process killed"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "kill failed"),
        }
    }
    victims.len()
}

/// A live (non-zombie) process as seen in `/proc`
#[derive(Debug, Clone, Default)]
struct ProcEntry {
    ppid: u32,
    environ: Vec<u8>,
}

fn process_table() -> HashMap<u32, ProcEntry> {
    let mut table = HashMap::new();
    let Ok(dir) = std::fs::read_dir("/proc") else {
        return table;
    };
    for entry in dir.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((state, ppid)) = parse_stat(&stat) else {
            continue;
        };
        if state == 'Z' || state == 'X' {
            continue;
        }
        let environ = std::fs::read(entry.path().join("environ")).unwrap_or_default();
        table.insert(pid, ProcEntry { ppid, environ });
    }
    table
}

/// State and parent pid from `/proc/<pid>/stat`; the command name may hold spaces
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn has_marker(environ: &[u8], marker: &[u8]) -> bool {
    environ.split(|b| *b == 0).any(|var| var == marker)
}

/// Processes carrying the marker, plus descendants of a still-marked root
fn run_members(
    table: &HashMap<u32, ProcEntry>,
    root: Option<u32>,
    marker: &[u8],
    own_pid: u32,
) -> HashSet<u32> {
    let mut members: HashSet<u32> = table
        .iter()
        .filter(|(_, p)| has_marker(&p.environ, marker))
        .map(|(pid, _)| *pid)
        .collect();

    // only trust the root pid while it still belongs to this run
    if let Some(root) = root.filter(|r| members.contains(r)) {
        let mut walked = HashSet::from([root]);
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for (pid, p) in table {
                if p.ppid == parent && walked.insert(*pid) {
                    members.insert(*pid);
                    frontier.push(*pid);
                }
            }
        }
    }
    members.remove(&own_pid);
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ppid: u32, environ: &str) -> ProcEntry {
        ProcEntry {
            ppid,
            environ: environ.replace(';', "\0").into_bytes(),
        }
    }

    #[test]
    fn test_parse_stat_with_spaces_in_name() {
        let stat = "4242 (my prog) S 17 4242 4242 0 -1 4194560";
        assert_eq!(parse_stat(stat), Some(('S', 17)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_marker_must_match_whole_entry() {
        assert!(has_marker(b"PATH=/bin\0CODERUN_RUN=ab\0", b"CODERUN_RUN=ab"));
        assert!(!has_marker(b"CODERUN_RUN=abc\0", b"CODERUN_RUN=ab"));
        assert!(!has_marker(b"", b"CODERUN_RUN=ab"));
    }

    #[test]
    fn test_members_follow_marker_and_tree() {
        let marker = "CODERUN_RUN=ab";
        let table: HashMap<u32, ProcEntry> = [
            (1, entry(0, "PATH=/bin")),
            (10, entry(1, "CODERUN_RUN=ab")),
            // cleared its environment but still a child of the program
            (11, entry(10, "")),
            (12, entry(11, "")),
            // marked child whose own child dropped the marker
            (13, entry(10, "CODERUN_RUN=ab")),
            (14, entry(13, "")),
            // reparented to init after setsid + exit of its parent
            (20, entry(1, "HOME=/x;CODERUN_RUN=ab")),
            // another run
            (30, entry(1, "CODERUN_RUN=cd")),
            (31, entry(30, "")),
            // the server itself
            (99, entry(1, "CODERUN_RUN=ab")),
        ]
        .into_iter()
        .collect();

        let members = run_members(&table, Some(10), marker.as_bytes(), 99);
        let mut members: Vec<u32> = members.into_iter().collect();
        members.sort_unstable();
        assert_eq!(members, vec![10, 11, 12, 13, 14, 20]);
    }

    #[test]
    fn test_reused_root_pid_is_not_walked() {
        let table: HashMap<u32, ProcEntry> = [
            (10, entry(1, "PATH=/bin")),
            (11, entry(10, "")),
        ]
        .into_iter()
        .collect();
        assert!(run_members(&table, Some(10), b"CODERUN_RUN=ab", 99).is_empty());
    }
}
