//! Process discovery: is the core already alive at the OS level?
//!
//! Discovery never fails. The platform's primary listing is tried first,
//! then the fallback; if both fail the core is reported as not running,
//! since the user can always be warned and retry.

use crate::platform::{Platform, ProcessInfo};
use std::collections::{HashMap, HashSet};

/// A running instance of the core found by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningInstance {
    pub pid: u32,
    /// Whether this is the instance the supervisor itself launched.
    pub ours: bool,
}

/// List processes, primary strategy first. `None` if both strategies fail.
pub fn list_processes(platform: &dyn Platform) -> Option<Vec<ProcessInfo>> {
    match platform.list_processes() {
        Ok(processes) => return Some(processes),
        Err(e) => {
            tracing::warn!(error = %e, platform = platform.name(), "process listing failed, trying fallback");
        }
    }
    match platform.list_processes_fallback() {
        Ok(processes) => Some(processes),
        Err(e) => {
            tracing::warn!(error = %e, "fallback process listing failed, assuming not running");
            None
        }
    }
}

/// Find a process whose image name matches `image_name` (case-insensitive).
///
/// `tracked_pid` is the pid the supervisor currently manages, if any; a match
/// on it is reported as `ours`.
pub fn find_running(
    platform: &dyn Platform,
    image_name: &str,
    tracked_pid: Option<u32>,
) -> Option<RunningInstance> {
    let processes = list_processes(platform)?;
    let found = find_in(&processes, image_name, tracked_pid);
    match found {
        Some(instance) => tracing::info!(
            pid = instance.pid,
            image = image_name,
            tracked_pid = ?tracked_pid,
            ours = instance.ours,
            "found running core process"
        ),
        None => tracing::debug!(
            image = image_name,
            checked = processes.len(),
            "no running core process found"
        ),
    }
    found
}

/// Matching step of [`find_running`] over an existing listing.
///
/// The tracked instance wins over other matches.
pub fn find_in(
    processes: &[ProcessInfo],
    image_name: &str,
    tracked_pid: Option<u32>,
) -> Option<RunningInstance> {
    let mut matches = processes
        .iter()
        .filter(|p| name_matches(&p.name, image_name))
        .map(|p| p.pid);

    let first = matches.next()?;
    let pid = match tracked_pid {
        Some(tracked) if first != tracked => {
            if matches.any(|pid| pid == tracked) {
                tracked
            } else {
                first
            }
        }
        _ => first,
    };
    Some(RunningInstance {
        pid,
        ours: tracked_pid == Some(pid),
    })
}

/// Whether `pid` is alive and still carries `image_name`.
///
/// A pid that was recycled by an unrelated process is reported as not alive.
pub fn is_alive(platform: &dyn Platform, pid: u32, image_name: &str) -> bool {
    let Some(processes) = list_processes(platform) else {
        return false;
    };
    processes
        .iter()
        .any(|p| p.pid == pid && name_matches(&p.name, image_name))
}

/// Longest process name the Linux kernel reports (`TASK_COMM_LEN - 1`).
const COMM_LEN: usize = 15;

/// Case-insensitive image match that also accepts the kernel's truncated
/// 15-byte form of a longer name.
pub fn name_matches(listed: &str, image_name: &str) -> bool {
    if listed.eq_ignore_ascii_case(image_name) {
        return true;
    }
    listed.len() == COMM_LEN
        && image_name.len() > COMM_LEN
        && image_name
            .get(..COMM_LEN)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(listed))
}

/// All transitive descendants of `root` (excluding `root` itself).
pub fn descendants(root: u32, processes: &[ProcessInfo]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for process in processes {
        if let Some(parent) = process.parent {
            if parent != process.pid {
                children.entry(parent).or_default().push(process.pid);
            }
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<u32> = HashSet::new();
    let mut out = Vec::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if current != root {
            out.push(current);
        }
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|k| !seen.contains(*k)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    fn proc(pid: u32, parent: Option<u32>, name: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            parent,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_find_in_matches_case_insensitively() {
        let procs = vec![proc(1, None, "init"), proc(40, Some(1), "Sing-Box.EXE")];
        let found = find_in(&procs, "sing-box.exe", None).unwrap();
        assert_eq!(found, RunningInstance { pid: 40, ours: false });
    }

    #[test]
    fn test_find_in_reports_tracked_instance_as_ours() {
        let procs = vec![proc(40, None, "sing-box"), proc(41, None, "sing-box")];
        let found = find_in(&procs, "sing-box", Some(41)).unwrap();
        assert_eq!(found, RunningInstance { pid: 41, ours: true });

        let foreign = find_in(&procs, "sing-box", Some(99)).unwrap();
        assert_eq!(foreign, RunningInstance { pid: 40, ours: false });
    }

    #[test]
    fn test_find_in_no_match() {
        let procs = vec![proc(1, None, "init"), proc(2, Some(1), "sing-box-helper")];
        assert_eq!(find_in(&procs, "sing-box", None), None);
    }

    #[test]
    fn test_long_image_matches_truncated_comm() {
        let image = "sing-box-custom-build";
        let procs = vec![proc(1, None, "init"), proc(60, Some(1), "sing-box-custom")];
        let found = find_in(&procs, image, None).unwrap();
        assert_eq!(found.pid, 60);

        let fake = FakePlatform::new();
        fake.set_processes(procs);
        assert!(is_alive(&fake, 60, image));
    }

    #[test]
    fn test_truncation_match_needs_full_comm_width() {
        assert!(name_matches("SING-BOX-CUSTOM", "sing-box-custom-build"));
        assert!(!name_matches("sing-box-custo", "sing-box-custom-build"));
        assert!(!name_matches("sing-box-custom", "sing-box-other-build"));
        assert!(!name_matches("sing-box", "sing-box-custom-build"));
    }

    #[test]
    fn test_find_running_uses_fallback_when_primary_fails() {
        let fake = FakePlatform::new();
        fake.set_listing_fails(true);
        fake.set_fallback_processes(vec![proc(77, None, "sing-box")]);
        let found = find_running(&fake, "sing-box", None);
        assert_eq!(found, Some(RunningInstance { pid: 77, ours: false }));
    }

    #[test]
    fn test_find_running_fails_open_when_both_listings_fail() {
        let fake = FakePlatform::new();
        fake.set_listing_fails(true);
        fake.set_fallback_fails(true);
        fake.set_processes(vec![proc(77, None, "sing-box")]);
        assert_eq!(find_running(&fake, "sing-box", None), None);
    }

    #[test]
    fn test_is_alive_checks_name_too() {
        let fake = FakePlatform::new();
        fake.set_processes(vec![proc(500, None, "sing-box"), proc(501, None, "bash")]);
        assert!(is_alive(&fake, 500, "sing-box"));
        assert!(!is_alive(&fake, 501, "sing-box"));
        assert!(!is_alive(&fake, 502, "sing-box"));
    }

    #[test]
    fn test_descendants_walks_the_tree() {
        let procs = vec![
            proc(10, Some(1), "sing-box"),
            proc(11, Some(10), "helper"),
            proc(12, Some(11), "grandchild"),
            proc(13, Some(1), "unrelated"),
            proc(14, Some(10), "helper2"),
        ];
        let mut found = descendants(10, &procs);
        found.sort_unstable();
        assert_eq!(found, vec![11, 12, 14]);
        assert!(descendants(13, &procs).is_empty());
    }

    #[test]
    fn test_descendants_survives_cycles() {
        let procs = vec![proc(1, Some(2), "a"), proc(2, Some(1), "b")];
        assert_eq!(descendants(1, &procs), vec![2]);
    }
}
