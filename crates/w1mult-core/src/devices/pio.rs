use log::info;

use crate::program::Program;
use crate::request::Reply;
use crate::retry::with_retries;
use crate::status::{RequestError, W1Error};
use crate::topology::{Bus, DeviceId};

use super::Family;

/// Channel-access write.
pub const CHANNEL_ACCESS_WRITE: u8 = 0x5A;
/// Confirmation of a correctly received write.
pub const WRITE_CONFIRMED: u8 = 0xAA;
/// Reply of a device that did not receive the complement correctly.
pub const WRITE_GARBLED: u8 = 0xFF;

/// DS2408 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioOutputs {
    /// Output latch state to keep in the device. A 1 bit leaves the pin
    /// released.
    pub outputs: u8,
}

impl Default for PioOutputs {
    fn default() -> Self {
        Self { outputs: 0xFF }
    }
}

/// Requests understood by the 8-channel switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PioRequest {
    /// Sets the output latches.
    SetOutputs(u8),
    /// Output latch state last set.
    ReadOutputs,
}

fn outputs(bus: &Bus, id: DeviceId) -> Option<u8> {
    match &bus.net().device(id).family {
        Family::PioOutputs(state) => Some(state.outputs),
        _ => None,
    }
}

/// Classifies the confirmation byte of a channel-access write.
///
/// # Errors
///
/// `CrcError` when the device saw a garbled complement, `BusError` for
/// anything else unexpected.
pub const fn check_confirmation(reply: u8) -> Result<(), W1Error> {
    match reply {
        WRITE_CONFIRMED => Ok(()),
        WRITE_GARBLED => Err(W1Error::CrcError),
        _ => Err(W1Error::BusError),
    }
}

/// Writes the output latches. The PIO status byte that follows the
/// confirmation is not read; inputs may affect it.
fn write_outputs(bus: &mut Bus, id: DeviceId, value: u8) -> Result<(), W1Error> {
    with_retries("pio write", |_| {
        let mut program = Program::new();
        bus.address_device(&mut program, id);
        program
            .write_bytes(&[CHANNEL_ACCESS_WRITE, value, !value])
            .read_bytes(1);
        let reply = bus.run_ok(&program)?;
        check_confirmation(reply.first().copied().unwrap_or(WRITE_GARBLED))
    })
}

/// Restores the output state of a device found by a scan.
///
/// # Errors
///
/// Bus errors once the retries are used up.
pub fn init(bus: &mut Bus, id: DeviceId) -> Result<(), W1Error> {
    if let Some(value) = outputs(bus, id) {
        write_outputs(bus, id, value)?;
    }
    info!(target: "w1mult::bus", "pio {} is found", bus.net().device(id).rom);
    Ok(())
}

/// Serves an 8-channel switch request.
///
/// # Errors
///
/// `Offline` when setting outputs of a device that is not present; bus
/// errors from present devices.
pub fn request(bus: &mut Bus, id: DeviceId, request: PioRequest) -> Result<Reply, RequestError> {
    let Some(current) = outputs(bus, id) else {
        return Err(RequestError::InvalidRequest);
    };
    match request {
        PioRequest::SetOutputs(value) => {
            if !bus.net().device(id).found {
                return Err(RequestError::Offline);
            }
            write_outputs(bus, id, value)?;
            if let Family::PioOutputs(state) = &mut bus.net_mut().device_mut(id).family {
                state.outputs = value;
            }
            Ok(Reply::Done)
        }
        PioRequest::ReadOutputs => Ok(Reply::Byte(current)),
    }
}
