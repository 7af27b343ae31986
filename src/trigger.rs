//! Trigger controller hook
//!
//! Hardware that fires synchronized start and stop pulses lives outside this
//! crate. The recorder only calls a controller before cameras are opened and
//! after every acquisition loop has closed.

use tracing::info;

use crate::capture::Systems;
use crate::config::RecordingConfig;
use crate::error::{Error, Result};

pub trait TriggerController: Send {
    fn name(&self) -> &'static str;

    fn start_triggers(&mut self, systems: &Systems, config: &RecordingConfig) -> Result<()>;

    fn stop_triggers(&mut self, systems: &Systems, config: &RecordingConfig) -> Result<()>;
}

/// Controller for free-running cameras
#[derive(Debug, Default)]
pub struct NoTrigger;

impl TriggerController for NoTrigger {
    fn name(&self) -> &'static str {
        "none"
    }

    fn start_triggers(&mut self, _systems: &Systems, _config: &RecordingConfig) -> Result<()> {
        info!("No trigger controller, cameras run free");
        Ok(())
    }

    fn stop_triggers(&mut self, _systems: &Systems, _config: &RecordingConfig) -> Result<()> {
        Ok(())
    }
}

/// Controller named by `trigger_controller`, or `None` when triggers are off.
pub fn from_config(config: &RecordingConfig) -> Result<Option<Box<dyn TriggerController>>> {
    let controller: Box<dyn TriggerController> = match config.trigger_controller.as_str() {
        "none" => Box::new(NoTrigger),
        other => {
            return Err(Error::config(format!(
                "trigger controller '{other}' is not available (known: none)"
            )))
        }
    };
    Ok(config.start_triggers.then_some(controller))
}
