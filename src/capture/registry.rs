//! Static registry of camera makes and the systems loaded for a run

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{error, info, instrument};

use super::{emulated, v4l2, CameraSystem, DeviceInfo};
use crate::config::{CameraConfig, RecordingConfig};
use crate::error::{Error, Result};

type Constructor = fn(&RecordingConfig) -> Result<Arc<dyn CameraSystem>>;

/// Make identifier → system constructor
static REGISTRY: Lazy<BTreeMap<&'static str, Constructor>> = Lazy::new(|| {
    let mut makes: BTreeMap<&'static str, Constructor> = BTreeMap::new();
    makes.insert(v4l2::MAKE, v4l2::V4l2System::load);
    makes.insert(emulated::MAKE, emulated::EmulatedSystem::load);
    #[cfg(feature = "gstreamer-pipeline")]
    makes.insert(super::gst_capture::MAKE, super::gst_capture::GstSystem::load);
    makes
});

pub fn known_makes() -> String {
    REGISTRY.keys().copied().collect::<Vec<_>>().join(", ")
}

pub fn ensure_registered(make: &str) -> Result<()> {
    if REGISTRY.contains_key(make) {
        Ok(())
    } else {
        Err(Error::UnknownMake(make.to_string(), known_makes()))
    }
}

/// Load the system registered for `make`.
pub fn load_system(make: &str, config: &RecordingConfig) -> Result<Arc<dyn CameraSystem>> {
    let constructor = REGISTRY
        .get(make)
        .ok_or_else(|| Error::UnknownMake(make.to_string(), known_makes()))?;
    constructor(config)
}

/// A loaded system and the devices it found
pub struct LoadedSystem {
    pub system: Arc<dyn CameraSystem>,
    pub devices: Vec<DeviceInfo>,
}

/// Every camera system used by a recording, keyed by make
#[derive(Default)]
pub struct Systems {
    systems: BTreeMap<String, LoadedSystem>,
}

impl Systems {
    /// Load one system per configured make and enumerate its devices.
    #[instrument(skip(config))]
    pub fn load(config: &RecordingConfig) -> Result<Self> {
        let mut systems = Self::default();
        for make in config.makes()? {
            let system = load_system(&make, config)?;
            systems.insert(system)?;
        }
        Ok(systems)
    }

    /// Add an already constructed system and enumerate its devices.
    pub fn insert(&mut self, system: Arc<dyn CameraSystem>) -> Result<()> {
        let devices = system.device_list()?;
        info!(
            "Loaded {} system with {} device(s): {:?}",
            system.make(),
            devices.len(),
            devices.iter().map(|d| &d.serial_number).collect::<Vec<_>>()
        );
        self.systems
            .insert(system.make().to_string(), LoadedSystem { system, devices });
        Ok(())
    }

    pub fn get(&self, make: &str) -> Option<&LoadedSystem> {
        self.systems.get(make)
    }

    /// Pick the device a camera selects and let its system complete the
    /// camera configuration.
    pub fn prepare_camera(
        &self,
        mut config: CameraConfig,
    ) -> Result<(Arc<dyn CameraSystem>, DeviceInfo, CameraConfig)> {
        let loaded = self
            .systems
            .get(&config.camera_make)
            .ok_or_else(|| Error::UnknownMake(config.camera_make.clone(), known_makes()))?;

        let device = loaded
            .devices
            .get(config.camera_selection)
            .cloned()
            .ok_or_else(|| {
                Error::device(
                    "load device",
                    format!(
                        "{} selects {} device {} but only {} found",
                        config.camera_name,
                        config.camera_make,
                        config.camera_selection,
                        loaded.devices.len()
                    ),
                )
            })?;

        loaded.system.load_device(&device, &mut config)?;
        Ok((Arc::clone(&loaded.system), device, config))
    }

    /// Close every system. Failures are logged, not returned.
    pub fn close(self) {
        info!("Closing camera systems");
        for (make, loaded) in self.systems {
            if let Err(e) = loaded.system.close(&loaded.devices) {
                error!("Failed to close {} system: {}", make, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_makes_are_registered() {
        assert!(ensure_registered("v4l2").is_ok());
        assert!(ensure_registered("emu").is_ok());
        assert!(matches!(
            ensure_registered("basler"),
            Err(Error::UnknownMake(make, _)) if make == "basler"
        ));
    }

    #[test]
    fn prepare_camera_assigns_serial() {
        let config = RecordingConfig {
            num_cams: 2,
            camera_make: "emu".to_string().into(),
            ..Default::default()
        };
        let systems = Systems::load(&config).unwrap();
        let cam = config.camera_config(1).unwrap();
        let (system, device, cam) = systems.prepare_camera(cam).unwrap();

        assert_eq!(system.make(), "emu");
        assert_eq!(cam.camera_serial_no.as_deref(), Some(device.serial_number.as_str()));
        systems.close();
    }

    #[test]
    fn selection_out_of_range_is_a_device_error() {
        let config = RecordingConfig {
            camera_make: "emu".to_string().into(),
            camera_selection: Some(vec![999]),
            ..Default::default()
        };
        let systems = Systems::load(&config).unwrap();
        let cam = config.camera_config(0).unwrap();
        assert!(matches!(
            systems.prepare_camera(cam),
            Err(Error::Device { .. })
        ));
    }
}
