use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::HelperError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn build(command: &[String]) -> Result<Command, HelperError> {
    let (program, args) = command.split_first().ok_or(HelperError::EmptyCommand)?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// # HelperProcess
/// The acquisition helper that streams DMA buffers to the server, run as a child with its output
/// discarded. A child still running when this is dropped is killed.
#[derive(Debug)]
pub struct HelperProcess {
    child: Child,
    name: String,
}

impl HelperProcess {
    pub fn start(command: &[String]) -> Result<Self, HelperError> {
        let child = build(command)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let name = command.join(" ");
        log::info!("Started helper {:?} with pid {}", name, child.id());
        Ok(Self { child, name })
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the helper to stop with stop_command, give it grace to exit, then kill it
    pub fn stop(&mut self, stop_command: &[String], grace: Duration) -> Result<ExitStatus, HelperError> {
        if !stop_command.is_empty() {
            let output = build(stop_command)?.stdin(Stdio::null()).output()?;
            if output.status.success() {
                log::info!("Helper stop command {:?} succeeded", stop_command.join(" "));
            } else {
                log::error!(
                    "Error executing {:?}: {}",
                    stop_command.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = self.child.try_wait()? {
                log::info!("Helper {:?} exited with {}", self.name, status);
                return Ok(status);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        log::warn!("Helper {:?} still running after {:?}, killing it", self.name, grace);
        self.child.kill()?;
        let status = self.child.wait()?;
        log::info!("Helper {:?} killed ({})", self.name, status);
        Ok(status)
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            log::warn!("Killing helper {:?} left running", self.name);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
