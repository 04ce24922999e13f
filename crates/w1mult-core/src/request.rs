//! Per-device request surface.

use std::ops::RangeInclusive;

use crate::devices::{AdRequest, BatteryRequest, PioRequest, Sample, ThermometerRequest};
use crate::logstore::LogHandle;
use crate::rom::DeviceKind;
use crate::status::RequestError;

/// A request addressed to one configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Request {
    /// Family of the device. Every device answers.
    GetType,
    /// Thermometer request.
    Thermometer(ThermometerRequest),
    /// Battery monitor request.
    Battery(BatteryRequest),
    /// A/D converter request.
    AdConverter(AdRequest),
    /// Output switch request.
    Pio(PioRequest),
}

/// Successful answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Reply {
    /// The request was carried out.
    Done,
    /// Device family.
    Type(DeviceKind),
    /// Read handle of the log the configured values go to.
    Log(LogHandle),
    /// Read handles of the four A/D ports; `None` for outputs.
    PortLogs([Option<LogHandle>; 4]),
    /// Last sampled value, if any.
    Sample(Option<Sample>),
    /// Last sampled values of the four A/D ports.
    Ports([Option<Sample>; 4]),
    /// A register byte.
    Byte(u8),
    /// An 8-byte memory page.
    Page([u8; 8]),
}

/// Valid range of a request parameter.
pub(crate) fn check<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<T, RequestError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(RequestError::InvalidRequest)
    }
}
