//! Host-OS desktop notifications for milestones and failures.

use std::process::Command;

use tracing::debug;

/// Sink for milestone notifications. Failures to notify are never fatal;
/// callers log and move on.
pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, message: &str) -> std::io::Result<()>;
}

/// Notifier backed by the host OS notification command.
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for DesktopNotifier {
    fn send(&self, title: &str, message: &str) -> std::io::Result<()> {
        let status = if cfg!(target_os = "macos") {
            let script = format!(r#"display notification "{message}" with title "{title}""#);
            Command::new("osascript").args(["-e", &script]).status()?
        } else {
            Command::new("notify-send").args([title, message]).status()?
        };

        if !status.success() {
            return Err(std::io::Error::other(format!(
                "notification command exited with {status}"
            )));
        }

        debug!(title, "desktop notification sent");
        Ok(())
    }
}

/// Notifier that drops everything (tests, headless environments).
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn send(&self, _title: &str, _message: &str) -> std::io::Result<()> {
        Ok(())
    }
}
