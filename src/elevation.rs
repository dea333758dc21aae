//! Privileged start through a trampoline script.
//!
//! Elevated processes live in another privilege domain, so the supervisor
//! cannot hold a normal child handle for the core. Instead a small shell
//! script is run under the elevator command (`pkexec`, `sudo -A`, ...):
//!
//! 1. it prints its own pid,
//! 2. starts the core in the background and prints the core's pid,
//! 3. waits on the core, so the script exits exactly when the core does.
//!
//! The two pids are the only handle on the core; they are also persisted to
//! the breadcrumb file.

use crate::breadcrumb::ElevatedPids;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process::{Command, Stdio};

/// Inputs for the trampoline script.
#[derive(Debug, Clone)]
pub struct TrampolinePlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub log: PathBuf,
}

/// Quote a string for POSIX `sh` using single quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render the trampoline script.
pub fn build_trampoline(plan: &TrampolinePlan) -> String {
    let mut command = shell_quote(&plan.program.to_string_lossy());
    for arg in &plan.args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    // The core pid is only reported once the log and the binary are usable,
    // so a launch that cannot work ends before the second line.
    format!(
        "#!/bin/sh\n\
         echo $$\n\
         cd {dir} || exit 1\n\
         exec 3>>{log} || exit 1\n\
         [ -x {program} ] || exit 127\n\
         {command} >&3 2>&3 3>&- &\n\
         child=$!\n\
         exec 3>&-\n\
         echo \"$child\"\n\
         wait \"$child\"\n\
         exit $?\n",
        dir = shell_quote(&plan.working_dir.to_string_lossy()),
        log = shell_quote(&plan.log.to_string_lossy()),
        program = shell_quote(&plan.program.to_string_lossy()),
    )
}

/// Write the trampoline script and make it executable.
pub fn write_trampoline(path: &Path, plan: &TrampolinePlan) -> std::io::Result<()> {
    std::fs::write(path, build_trampoline(plan))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Read the two pid lines the trampoline prints.
///
/// Returns `Ok(None)` if the stream ends before both lines arrive (the
/// elevation was refused or the script never ran).
pub fn read_pid_lines(reader: impl Read) -> Result<Option<ElevatedPids>, ElevationError> {
    let mut reader = BufReader::new(reader);
    let mut pids = [0u32; 2];
    for slot in pids.iter_mut() {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(|e| ElevationError::Io {
            context: "reading trampoline output",
            source: e,
        })?;
        if n == 0 {
            return Ok(None);
        }
        *slot = line
            .trim()
            .parse()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| ElevationError::Protocol {
                detail: format!("expected a pid, got {:?}", line.trim()),
            })?;
    }
    Ok(Some(ElevatedPids {
        wrapper: pids[0],
        child: pids[1],
    }))
}

/// Run `script` under the elevator command. Blocks through the elevation
/// prompt until both pids have been reported.
#[cfg(unix)]
pub fn launch(
    elevator: &[String],
    script: &Path,
) -> Result<(std::process::Child, ElevatedPids), ElevationError> {
    let (program, prefix_args) = elevator.split_first().ok_or(ElevationError::Unsupported)?;

    tracing::info!(elevator = %program, script = %script.display(), "requesting elevation");
    let mut child = Command::new(program)
        .args(prefix_args)
        .arg("/bin/sh")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ElevationError::Io {
            context: "spawning elevator",
            source: e,
        })?;

    let stdout = child.stdout.take().ok_or(ElevationError::Protocol {
        detail: "elevator stdout not captured".to_string(),
    })?;
    let stderr = child.stderr.take().map(drain_stderr);

    match read_pid_lines(stdout) {
        Ok(Some(pids)) => Ok((child, pids)),
        Ok(None) => {
            let status = child.wait().ok();
            let stderr = stderr
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            Err(ElevationError::Denied {
                detail: describe_refusal(status, &stderr),
            })
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Read the elevator's stderr to the end on its own thread, keeping the
/// first few KiB. The pipe stays open for as long as the wrapper runs.
#[cfg(unix)]
fn drain_stderr(stderr: std::process::ChildStderr) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut stderr = stderr;
        let mut kept = Vec::new();
        let _ = (&mut stderr).take(STDERR_KEEP).read_to_end(&mut kept);
        let _ = std::io::copy(&mut stderr, &mut std::io::sink());
        String::from_utf8_lossy(&kept).into_owned()
    })
}

#[cfg(unix)]
const STDERR_KEEP: u64 = 4096;

/// Send SIGTERM to both pids through the elevator. Blocks until done.
#[cfg(unix)]
pub fn terminate(elevator: &[String], pids: ElevatedPids) -> Result<(), ElevationError> {
    let (program, prefix_args) = elevator.split_first().ok_or(ElevationError::Unsupported)?;

    let output = Command::new(program)
        .args(prefix_args)
        .args(["kill", "-TERM"])
        .arg(pids.wrapper.to_string())
        .arg(pids.child.to_string())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ElevationError::Io {
            context: "spawning elevator",
            source: e,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ElevationError::Denied {
            detail: describe_refusal(
                Some(output.status),
                &String::from_utf8_lossy(&output.stderr),
            ),
        })
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn describe_refusal(status: Option<std::process::ExitStatus>, stderr: &str) -> String {
    let stderr = stderr.trim();
    match (status, stderr.is_empty()) {
        (Some(status), true) => format!("elevator exited with {status}"),
        (Some(status), false) => format!("elevator exited with {status}: {stderr}"),
        (None, false) => stderr.to_string(),
        (None, true) => "elevator exited without reporting pids".to_string(),
    }
}

/// Errors from the elevation path.
#[derive(Debug)]
pub enum ElevationError {
    /// No elevation mechanism on this platform (or none configured).
    Unsupported,
    /// The user declined, or the elevator failed.
    Denied { detail: String },
    /// The trampoline printed something other than two pids.
    Protocol { detail: String },
    Io {
        context: &'static str,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ElevationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElevationError::Unsupported => {
                write!(f, "privilege elevation is not supported on this platform")
            }
            ElevationError::Denied { detail } => write!(f, "elevation denied: {detail}"),
            ElevationError::Protocol { detail } => {
                write!(f, "unexpected trampoline output: {detail}")
            }
            ElevationError::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for ElevationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ElevationError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> TrampolinePlan {
        TrampolinePlan {
            program: PathBuf::from("/opt/core/sing-box"),
            args: vec!["run".to_string(), "-c".to_string(), "config.json".to_string()],
            working_dir: PathBuf::from("/opt/core"),
            log: PathBuf::from("/var/log/core.log"),
        }
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_trampoline_reports_pids_then_waits() {
        let script = build_trampoline(&plan());
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/sh");
        assert_eq!(lines[1], "echo $$");
        assert!(script.contains("exec 3>>'/var/log/core.log' || exit 1"));
        assert!(script.contains("[ -x '/opt/core/sing-box' ] || exit 127"));
        assert!(script.contains("'/opt/core/sing-box' 'run' '-c' 'config.json' >&3 2>&3 3>&- &"));
        let open_log = script.find("exec 3>>").unwrap();
        let echo_child = script.find("echo \"$child\"").unwrap();
        let wait_child = script.find("wait \"$child\"").unwrap();
        assert!(open_log < echo_child);
        assert!(echo_child < wait_child);
    }

    #[test]
    fn test_read_pid_lines() {
        let pids = read_pid_lines("321\n322\n".as_bytes()).unwrap().unwrap();
        assert_eq!(
            pids,
            ElevatedPids {
                wrapper: 321,
                child: 322
            }
        );
    }

    #[test]
    fn test_read_pid_lines_short_stream_is_none() {
        assert!(read_pid_lines("".as_bytes()).unwrap().is_none());
        assert!(read_pid_lines("321\n".as_bytes()).unwrap().is_none());
    }

    #[test]
    fn test_read_pid_lines_garbage_is_protocol_error() {
        let err = read_pid_lines("Password:\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ElevationError::Protocol { .. }));
    }

    #[test]
    fn test_describe_refusal() {
        assert_eq!(
            describe_refusal(None, ""),
            "elevator exited without reporting pids"
        );
        assert_eq!(describe_refusal(None, " dismissed \n"), "dismissed");
    }

    #[cfg(unix)]
    #[test]
    fn test_trampoline_runs_under_plain_sh() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start-core.sh");
        let log = dir.path().join("core.log");
        write_trampoline(
            &script,
            &TrampolinePlan {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "echo from-core; exit 4".to_string()],
                working_dir: dir.path().to_path_buf(),
                log: log.clone(),
            },
        )
        .unwrap();

        // `env` stands in for the elevator: it just runs the script.
        let (mut child, pids) = launch(&["env".to_string()], &script).unwrap();
        assert!(pids.wrapper > 0);
        assert!(pids.child > 0);
        assert_ne!(pids.wrapper, pids.child);

        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(4));
        assert!(std::fs::read_to_string(&log).unwrap().contains("from-core"));
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_elevator_does_not_stall_launch() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start-core.sh");
        write_trampoline(
            &script,
            &TrampolinePlan {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "exit 0".to_string()],
                working_dir: dir.path().to_path_buf(),
                log: dir.path().join("core.log"),
            },
        )
        .unwrap();

        // Far more than a pipe buffer on stderr before the script even runs.
        let elevator = [
            "sh".to_string(),
            "-c".to_string(),
            "head -c 200000 /dev/zero >&2; exec \"$@\"".to_string(),
            "elevator".to_string(),
        ];
        let (mut child, pids) = launch(&elevator, &script).unwrap();
        assert!(pids.child > 0);
        assert!(child.wait().unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn test_unopenable_log_reports_no_core_pid() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start-core.sh");
        let log = dir.path().join("missing").join("core.log");
        write_trampoline(
            &script,
            &TrampolinePlan {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), "sleep 30".to_string()],
                working_dir: dir.path().to_path_buf(),
                log,
            },
        )
        .unwrap();

        let err = launch(&["env".to_string()], &script).unwrap_err();
        assert!(matches!(err, ElevationError::Denied { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_program_reports_no_core_pid() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start-core.sh");
        write_trampoline(
            &script,
            &TrampolinePlan {
                program: dir.path().join("bin").join("sing-box"),
                args: vec![],
                working_dir: dir.path().to_path_buf(),
                log: dir.path().join("core.log"),
            },
        )
        .unwrap();

        let err = launch(&["env".to_string()], &script).unwrap_err();
        match err {
            ElevationError::Denied { detail } => assert!(detail.contains("127"), "{detail}"),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_with_refusing_elevator_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start-core.sh");
        write_trampoline(&script, &plan()).unwrap();

        let err = launch(&["false".to_string()], &script).unwrap_err();
        assert!(matches!(err, ElevationError::Denied { .. }));
    }

    #[test]
    fn test_empty_elevator_is_unsupported() {
        #[cfg(unix)]
        {
            let err = launch(&[], Path::new("/tmp/none.sh")).unwrap_err();
            assert!(matches!(err, ElevationError::Unsupported));
        }
        assert!(ElevationError::Unsupported
            .to_string()
            .contains("not supported"));
    }
}
