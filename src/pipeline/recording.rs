//! Whole-run lifecycle: prepare every camera, trigger, then shut down

use tracing::{error, info};

use super::session::CameraPipeline;
use super::signal::StopSignal;
use crate::capture::Systems;
use crate::config::RecordingConfig;
use crate::display::HeadlessRelay;
use crate::error::Result;
use crate::trigger::TriggerController;

/// Loaded systems, prepared pipelines and a started trigger controller
pub struct Recording {
    config: RecordingConfig,
    systems: Systems,
    triggers: Option<Box<dyn TriggerController>>,
    pipelines: Vec<CameraPipeline>,
}

impl Recording {
    /// Pick every camera's device, then start the triggers.
    ///
    /// Nothing is triggered unless every camera could be prepared. On
    /// failure the systems are closed before the error is returned.
    pub fn prepare(
        config: RecordingConfig,
        systems: Systems,
        mut triggers: Option<Box<dyn TriggerController>>,
        preview: bool,
    ) -> Result<Self> {
        let pipelines = match prepare_pipelines(&systems, &config, preview) {
            Ok(pipelines) => pipelines,
            Err(e) => {
                systems.close();
                return Err(e);
            }
        };

        if let Some(controller) = triggers.as_mut() {
            if let Err(e) = controller.start_triggers(&systems, &config) {
                systems.close();
                return Err(e);
            }
            info!("Started {} triggers", controller.name());
        }

        Ok(Self {
            config,
            systems,
            triggers,
            pipelines,
        })
    }

    pub fn stop_handles(&self) -> Vec<StopSignal> {
        self.pipelines.iter().map(CameraPipeline::stop_handle).collect()
    }

    /// Hand the pipelines over to whoever runs them.
    pub fn take_pipelines(&mut self) -> Vec<CameraPipeline> {
        std::mem::take(&mut self.pipelines)
    }

    /// Stop the triggers and close every camera system.
    pub fn finish(mut self) {
        if let Some(controller) = self.triggers.as_mut() {
            if let Err(e) = controller.stop_triggers(&self.systems, &self.config) {
                error!("Failed to stop triggers: {}", e);
            }
        }
        self.systems.close();
    }
}

fn prepare_pipelines(
    systems: &Systems,
    config: &RecordingConfig,
    preview: bool,
) -> Result<Vec<CameraPipeline>> {
    let mut pipelines = Vec::with_capacity(config.num_cams);
    for n in 0..config.num_cams {
        let (system, device, camera) = systems.prepare_camera(config.camera_config(n)?)?;
        let mut pipeline = CameraPipeline::new(system, device, camera);
        if preview {
            pipeline = pipeline.with_display(Box::new(HeadlessRelay::default()));
        }
        pipelines.push(pipeline);
    }
    Ok(pipelines)
}
