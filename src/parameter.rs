//! Parameter registry
//!
//! Named parameters addressed by `(module, parameter)`, where the module is a
//! camera id or [`ACQUISITION_MODULE`]. Values travel as strings on the wire;
//! this module parses and validates them against the current
//! [`StateSnapshot`] and turns accepted writes into a [`ParameterUpdate`]
//! for the Scheduler to apply between cycles.
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = state.snapshot();
//! assert_eq!(parameter::get(&snapshot, "port", "gain")?, "18");
//! match parameter::set(&snapshot, "port", "gain", "12.5")? {
//!     ParameterUpdate::Change(change) => changes.send(change).await?,
//!     ParameterUpdate::Stop => session.request_stop(TerminationReason::Operator),
//! };
//! ```

use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

use crate::config::{AcquisitionConfig, CameraConfig, Rotation, MAX_TRIGGER_RATE_HZ};
use crate::state::{ConfigChange, StateSnapshot};

/// Module name of run-level parameters.
pub const ACQUISITION_MODULE: &str = "acquisition";

/// Who may touch a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Name and access mode of one parameter.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub access: Access,
}

const fn rw(name: &'static str) -> ParameterInfo {
    ParameterInfo {
        name,
        access: Access::ReadWrite,
    }
}

const fn ro(name: &'static str) -> ParameterInfo {
    ParameterInfo {
        name,
        access: Access::ReadOnly,
    }
}

/// Parameters of every camera module.
pub const CAMERA_PARAMETERS: &[ParameterInfo] = &[
    rw("exposure_us"),
    rw("gain"),
    rw("label"),
    rw("trigger_divider"),
    rw("still_divider"),
    rw("video_divider"),
    rw("still_enabled"),
    rw("video_enabled"),
    rw("hdr_enabled"),
    // none, cw90, cw180, cw270, fliplr or flipud
    rw("rotation"),
];

/// Parameters of the acquisition module.
pub const ACQUISITION_PARAMETERS: &[ParameterInfo] = &[
    // Hz, > 0 and at most MAX_TRIGGER_RATE_HZ
    rw("trigger_rate"),
    // -1 for unlimited
    ro("trigger_limit"),
    ro("trigger_count"),
    ro("status"),
    // Any value stops the run
    ParameterInfo {
        name: "stop",
        access: Access::WriteOnly,
    },
];

/// Rejected get or set.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Unknown module '{0}'")]
    UnknownModule(String),
    #[error("Unknown parameter '{parameter}' in module '{module}'")]
    UnknownParameter { module: String, parameter: String },
    #[error("Parameter '{0}' is read-only")]
    ReadOnly(String),
    #[error("Parameter '{0}' is write-only")]
    WriteOnly(String),
    #[error("Invalid value for '{parameter}': {reason}")]
    InvalidValue { parameter: String, reason: String },
}

/// A single camera setting change.
#[derive(Clone, Debug, PartialEq)]
pub enum CameraSetting {
    ExposureUs(u32),
    Gain(f64),
    Label(String),
    TriggerDivider(u32),
    StillDivider(u32),
    VideoDivider(u32),
    StillEnabled(bool),
    VideoEnabled(bool),
    HdrEnabled(bool),
    Rotation(Rotation),
}

impl CameraSetting {
    /// Write the setting into `config`.
    pub fn apply(&self, config: &mut CameraConfig) {
        match self {
            CameraSetting::ExposureUs(v) => config.exposure_us = *v,
            CameraSetting::Gain(v) => config.gain = *v,
            CameraSetting::Label(v) => config.label = v.clone(),
            CameraSetting::TriggerDivider(v) => config.trigger_divider = *v,
            CameraSetting::StillDivider(v) => config.still_divider = *v,
            CameraSetting::VideoDivider(v) => config.video_divider = *v,
            CameraSetting::StillEnabled(v) => config.still_enabled = *v,
            CameraSetting::VideoEnabled(v) => config.video_enabled = *v,
            CameraSetting::HdrEnabled(v) => config.hdr_enabled = *v,
            CameraSetting::Rotation(v) => config.rotation = *v,
        }
    }

    /// Whether the device itself must be reconfigured.
    pub fn touches_device(&self) -> bool {
        matches!(self, CameraSetting::ExposureUs(_) | CameraSetting::Gain(_))
    }
}

/// Accepted write.
#[derive(Clone, Debug)]
pub enum ParameterUpdate {
    /// Queue for the Scheduler
    Change(ConfigChange),
    /// Operator stop
    Stop,
}

fn lookup(
    snapshot: &StateSnapshot,
    module: &str,
    parameter: &str,
) -> Result<&'static ParameterInfo, ParameterError> {
    let table = if module == ACQUISITION_MODULE {
        ACQUISITION_PARAMETERS
    } else if snapshot.camera(module).is_some() {
        CAMERA_PARAMETERS
    } else {
        return Err(ParameterError::UnknownModule(module.to_string()));
    };
    table
        .iter()
        .find(|p| p.name == parameter)
        .ok_or_else(|| ParameterError::UnknownParameter {
            module: module.to_string(),
            parameter: parameter.to_string(),
        })
}

/// Current value of a parameter, formatted for the wire.
pub fn get(snapshot: &StateSnapshot, module: &str, parameter: &str) -> Result<String, ParameterError> {
    let info = lookup(snapshot, module, parameter)?;
    if info.access == Access::WriteOnly {
        return Err(ParameterError::WriteOnly(parameter.to_string()));
    }

    if module == ACQUISITION_MODULE {
        let value = match parameter {
            "trigger_rate" => snapshot.trigger_rate.to_string(),
            "trigger_limit" => snapshot.trigger_limit.to_string(),
            "trigger_count" => snapshot.trigger_count.to_string(),
            _ => snapshot
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        return Ok(value);
    }

    let Some(camera) = snapshot.camera(module) else {
        return Err(ParameterError::UnknownModule(module.to_string()));
    };
    Ok(match parameter {
        "exposure_us" => camera.exposure_us.to_string(),
        "gain" => camera.gain.to_string(),
        "label" => camera.label.clone(),
        "trigger_divider" => camera.trigger_divider.to_string(),
        "still_divider" => camera.still_divider.to_string(),
        "video_divider" => camera.video_divider.to_string(),
        "still_enabled" => camera.still_enabled.to_string(),
        "video_enabled" => camera.video_enabled.to_string(),
        "hdr_enabled" => camera.hdr_enabled.to_string(),
        _ => camera.rotation.to_string(),
    })
}

/// Validate a write and build the corresponding update.
///
/// Nothing is applied here; the config stays unchanged until the Scheduler
/// drains the change.
pub fn set(
    snapshot: &StateSnapshot,
    module: &str,
    parameter: &str,
    value: &str,
) -> Result<ParameterUpdate, ParameterError> {
    let info = lookup(snapshot, module, parameter)?;
    if info.access == Access::ReadOnly {
        return Err(ParameterError::ReadOnly(parameter.to_string()));
    }

    if module == ACQUISITION_MODULE {
        return match parameter {
            "stop" => Ok(ParameterUpdate::Stop),
            _ => {
                let rate: f64 = parse(parameter, value)?;
                let rate = AcquisitionConfig::check_trigger_rate(rate)
                    .map_err(|_| invalid(parameter, &format!("must be > 0 and <= {} Hz", MAX_TRIGGER_RATE_HZ)))?;
                Ok(ParameterUpdate::Change(ConfigChange::TriggerRate(rate)))
            }
        };
    }

    let Some(camera) = snapshot.camera(module) else {
        return Err(ParameterError::UnknownModule(module.to_string()));
    };
    let setting = match parameter {
        "exposure_us" => {
            let v: u32 = parse(parameter, value)?;
            if v == 0 {
                return Err(invalid(parameter, "must be > 0"));
            }
            CameraSetting::ExposureUs(v)
        }
        "gain" => {
            let v: f64 = parse(parameter, value)?;
            if !(v.is_finite() && v >= 0.0) {
                return Err(invalid(parameter, "must be a non-negative number"));
            }
            CameraSetting::Gain(v)
        }
        "label" => CameraSetting::Label(value.to_string()),
        "trigger_divider" => CameraSetting::TriggerDivider(divider(parameter, value)?),
        "still_divider" => CameraSetting::StillDivider(divider(parameter, value)?),
        "video_divider" => CameraSetting::VideoDivider(divider(parameter, value)?),
        "still_enabled" => CameraSetting::StillEnabled(parse_bool(parameter, value)?),
        "video_enabled" => CameraSetting::VideoEnabled(parse_bool(parameter, value)?),
        "hdr_enabled" => {
            let enabled = parse_bool(parameter, value)?;
            if enabled && camera.hdr_brackets.is_empty() {
                return Err(invalid(parameter, "camera has no hdr_brackets configured"));
            }
            CameraSetting::HdrEnabled(enabled)
        }
        _ => {
            let rotation = Rotation::from_str(value).map_err(|e| invalid(parameter, &e.to_string()))?;
            CameraSetting::Rotation(rotation)
        }
    };

    Ok(ParameterUpdate::Change(ConfigChange::Camera {
        camera_id: camera.id.clone(),
        setting,
    }))
}

fn invalid(parameter: &str, reason: &str) -> ParameterError {
    ParameterError::InvalidValue {
        parameter: parameter.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T: FromStr>(parameter: &str, value: &str) -> Result<T, ParameterError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(parameter, &format!("cannot parse '{}'", value)))
}

fn divider(parameter: &str, value: &str) -> Result<u32, ParameterError> {
    let v: u32 = parse(parameter, value)?;
    if v == 0 {
        return Err(invalid(parameter, "must be >= 1"));
    }
    Ok(v)
}

fn parse_bool(parameter: &str, value: &str) -> Result<bool, ParameterError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(parameter, &format!("expected a boolean, got '{}'", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BracketSpec;
    use crate::session::RunStatus;

    fn snapshot() -> StateSnapshot {
        let mut hdr = CameraConfig::new("stbd");
        hdr.hdr_brackets = vec![BracketSpec {
            exposure_us: 1000,
            gain: 1.0,
            emit_signal: false,
            save_image: true,
        }];
        StateSnapshot {
            cameras: vec![CameraConfig::new("port"), hdr],
            trigger_rate: 5.0,
            trigger_limit: 100,
            trigger_count: 12,
            status: Some(RunStatus::Running),
            ..StateSnapshot::default()
        }
    }

    #[test]
    fn test_get_camera_and_acquisition_values() {
        let s = snapshot();
        assert_eq!(get(&s, "port", "exposure_us").unwrap(), "4000");
        assert_eq!(get(&s, "port", "rotation").unwrap(), "none");
        assert_eq!(get(&s, ACQUISITION_MODULE, "trigger_count").unwrap(), "12");
        assert_eq!(get(&s, ACQUISITION_MODULE, "status").unwrap(), "running");
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let s = snapshot();
        assert_eq!(
            get(&s, "bow", "gain"),
            Err(ParameterError::UnknownModule("bow".into()))
        );
        assert!(matches!(
            set(&s, "port", "shutter", "1"),
            Err(ParameterError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_access_rules() {
        let s = snapshot();
        assert!(matches!(
            set(&s, ACQUISITION_MODULE, "trigger_count", "3"),
            Err(ParameterError::ReadOnly(_))
        ));
        assert!(matches!(
            get(&s, ACQUISITION_MODULE, "stop"),
            Err(ParameterError::WriteOnly(_))
        ));
        assert!(matches!(
            set(&s, ACQUISITION_MODULE, "stop", ""),
            Ok(ParameterUpdate::Stop)
        ));
    }

    #[test]
    fn test_set_builds_camera_change() {
        let s = snapshot();
        match set(&s, "port", "rotation", "CW90").unwrap() {
            ParameterUpdate::Change(ConfigChange::Camera { camera_id, setting }) => {
                assert_eq!(camera_id, "port");
                assert_eq!(setting, CameraSetting::Rotation(Rotation::Cw90));
            }
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values() {
        let s = snapshot();
        assert!(matches!(
            set(&s, "port", "gain", "-1"),
            Err(ParameterError::InvalidValue { .. })
        ));
        assert!(set(&s, "port", "still_divider", "0").is_err());
        assert!(set(&s, "port", "video_enabled", "maybe").is_err());
        assert!(set(&s, ACQUISITION_MODULE, "trigger_rate", "0").is_err());
        assert!(set(&s, ACQUISITION_MODULE, "trigger_rate", "1e12").is_err());
        assert!(set(&s, ACQUISITION_MODULE, "trigger_rate", "inf").is_err());
        assert!(set(&s, ACQUISITION_MODULE, "trigger_rate", "1000").is_ok());
        // port has no brackets, stbd does
        assert!(set(&s, "port", "hdr_enabled", "true").is_err());
        assert!(set(&s, "stbd", "hdr_enabled", "true").is_ok());
    }

    #[test]
    fn test_setting_apply() {
        let mut config = CameraConfig::new("port");
        CameraSetting::Gain(2.5).apply(&mut config);
        CameraSetting::VideoEnabled(true).apply(&mut config);
        assert_eq!(config.gain, 2.5);
        assert!(config.video_enabled);
        assert!(CameraSetting::ExposureUs(10).touches_device());
        assert!(!CameraSetting::Label("x".into()).touches_device());
    }
}
