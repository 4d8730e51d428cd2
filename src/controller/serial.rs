//! Serial transport for the controller link.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ControllerEvent, ControllerLink};
use crate::config::ControllerConfig;
use crate::error::AppResult;
use crate::sensor_bus::SensorBus;

/// Open the configured serial port and start the link on it.
#[cfg(feature = "serial")]
pub fn connect(
    config: &ControllerConfig,
    sensors: Arc<SensorBus>,
) -> AppResult<(ControllerLink, mpsc::Receiver<ControllerEvent>)> {
    use crate::error::DaqError;
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&config.serial_port, config.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| {
            DaqError::Instrument(format!(
                "Failed to open controller serial port {}: {}",
                config.serial_port, e
            ))
        })?;

    tracing::info!(
        port = %config.serial_port,
        baud = config.baud_rate,
        "Opened controller serial port"
    );
    Ok(ControllerLink::spawn(port, config, sensors))
}

#[cfg(not(feature = "serial"))]
pub fn connect(
    _config: &ControllerConfig,
    _sensors: Arc<SensorBus>,
) -> AppResult<(ControllerLink, mpsc::Receiver<ControllerEvent>)> {
    Err(crate::error::DaqError::SerialFeatureDisabled)
}
