//! Tool availability checking
//!
//! Probes for the external tools the backends drive: `xcrun simctl` for
//! simulators and `ios-deploy` for physical devices. Checked once at startup
//! so missing tooling turns into a clear message instead of a spawn error
//! mid-operation.

use std::path::PathBuf;

/// Cached availability of the external tools.
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Whether `xcrun simctl` is available (macOS with Xcode)
    pub xcrun_simctl: bool,

    /// Whether `ios-deploy` is available
    pub ios_deploy: bool,

    /// Path to ios-deploy if found on PATH
    pub ios_deploy_path: Option<PathBuf>,
}

impl ToolAvailability {
    /// Check tool availability (run once at startup)
    pub async fn check() -> Self {
        let xcrun_simctl = Self::check_xcrun_simctl().await;
        let ios_deploy_path = which::which("ios-deploy").ok();

        Self {
            xcrun_simctl,
            ios_deploy: ios_deploy_path.is_some(),
            ios_deploy_path,
        }
    }

    /// Check if xcrun simctl is available
    async fn check_xcrun_simctl() -> bool {
        #[cfg(not(target_os = "macos"))]
        return false;

        #[cfg(target_os = "macos")]
        {
            use std::process::Stdio;
            use tokio::process::Command;

            Command::new("xcrun")
                .args(["simctl", "help"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .inspect_err(|e| tracing::debug!("xcrun simctl check failed: {}", e))
                .unwrap_or(false)
        }
    }

    /// User-friendly message when simulator tooling is unavailable
    pub fn simulator_unavailable_message(&self) -> Option<&'static str> {
        if self.xcrun_simctl {
            None
        } else {
            #[cfg(target_os = "macos")]
            {
                Some("Xcode not installed. Install Xcode to manage iOS simulators.")
            }

            #[cfg(not(target_os = "macos"))]
            {
                Some("iOS simulators are only available on macOS.")
            }
        }
    }

    /// User-friendly message when device tooling is unavailable
    pub fn device_unavailable_message(&self) -> Option<&'static str> {
        if self.ios_deploy {
            None
        } else {
            Some("ios-deploy not found. Install it (brew install ios-deploy) to debug physical devices.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_availability_default() {
        let availability = ToolAvailability::default();
        assert!(!availability.xcrun_simctl);
        assert!(!availability.ios_deploy);
        assert!(availability.ios_deploy_path.is_none());
    }

    #[test]
    fn test_simulator_unavailable_message() {
        let availability = ToolAvailability::default();
        assert!(availability.simulator_unavailable_message().is_some());
    }

    #[test]
    fn test_device_unavailable_message() {
        let availability = ToolAvailability::default();
        assert!(availability.device_unavailable_message().is_some());

        let availability = ToolAvailability {
            xcrun_simctl: true,
            ios_deploy: true,
            ios_deploy_path: Some(PathBuf::from("/opt/homebrew/bin/ios-deploy")),
        };
        assert!(availability.device_unavailable_message().is_none());
        assert!(availability.simulator_unavailable_message().is_none());
    }
}
