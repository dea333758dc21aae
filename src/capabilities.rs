/// File-capability check for running a TUN-enabled core without elevation.
///
/// On Linux the core can open a TUN device unprivileged if its binary carries
/// `cap_net_admin` and `cap_net_bind_service`. The check shells out to
/// `getcap` and, when the capabilities are missing, hands back the `setcap`
/// command the user has to run.
use std::path::Path;
use std::process::Command;

const REQUIRED: [&str; 2] = ["cap_net_admin", "cap_net_bind_service"];

/// Decides whether the core binary has the OS rights it needs.
pub trait CapabilityCheck: Send + Sync {
    /// `Err` carries a human-readable suggestion for fixing the binary.
    fn check(&self, executable: &Path) -> Result<(), String>;
}

/// `getcap`-based check.
pub struct GetcapCheck;

/// Accepts every binary.
pub struct NoCapabilityCheck;

/// Whether `getcap` output lists every required capability.
pub fn has_required_capabilities(getcap_output: &str) -> bool {
    REQUIRED.iter().all(|cap| getcap_output.contains(cap))
}

/// The command that grants the required capabilities.
pub fn suggestion(executable: &Path) -> String {
    format!(
        "The core needs network capabilities to create a TUN interface. Run:\n\n  sudo setcap {}=+ep {}",
        REQUIRED.join(","),
        executable.display()
    )
}

impl CapabilityCheck for GetcapCheck {
    fn check(&self, executable: &Path) -> Result<(), String> {
        // A missing binary is reported by the spawn step instead.
        if !executable.exists() {
            return Ok(());
        }
        let output = match Command::new("getcap").arg(executable).output() {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "getcap unavailable");
                return Err(suggestion(executable));
            }
        };
        if output.status.success()
            && has_required_capabilities(&String::from_utf8_lossy(&output.stdout))
        {
            Ok(())
        } else {
            Err(suggestion(executable))
        }
    }
}

impl CapabilityCheck for NoCapabilityCheck {
    fn check(&self, _executable: &Path) -> Result<(), String> {
        Ok(())
    }
}
