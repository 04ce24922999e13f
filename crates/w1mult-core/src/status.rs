use thiserror::Error;

/// Completion status reported by the bus transport for a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum StatusCode {
    /// Every step ran.
    Ok = 0,
    /// A reset or smart-on saw no presence pulse.
    NoDevicePresent = 1,
    /// A reset saw an alarming presence pulse.
    AlarmingPresencePulse = 2,
    /// The bus or branch is shorted.
    BusShorted = 3,
    /// Unexpected line state or data.
    BusError = 4,
    /// A checksum the transport verified did not match.
    CrcError = 5,
    /// The transport timed out waiting for the bus.
    Timeout = 6,
    /// The transport capability disappeared.
    TransportGone = 7,
    /// The program contained a malformed step.
    ProgramError = 8,
    /// The program steps were in an illegal order.
    SequenceError = 9,
}

impl StatusCode {
    /// Stable byte value used on the transport interface.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a stable byte value.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::NoDevicePresent),
            2 => Some(Self::AlarmingPresencePulse),
            3 => Some(Self::BusShorted),
            4 => Some(Self::BusError),
            5 => Some(Self::CrcError),
            6 => Some(Self::Timeout),
            7 => Some(Self::TransportGone),
            8 => Some(Self::ProgramError),
            9 => Some(Self::SequenceError),
            _ => None,
        }
    }

    /// Converts to `Ok(())` or the matching [`W1Error`].
    ///
    /// # Errors
    ///
    /// Returns the error variant for every status other than [`StatusCode::Ok`].
    pub const fn into_result(self) -> Result<(), W1Error> {
        match self {
            Self::Ok => Ok(()),
            Self::NoDevicePresent => Err(W1Error::NoDevicePresent),
            Self::AlarmingPresencePulse => Err(W1Error::AlarmingPresencePulse),
            Self::BusShorted => Err(W1Error::BusShorted),
            Self::BusError => Err(W1Error::BusError),
            Self::CrcError => Err(W1Error::CrcError),
            Self::Timeout => Err(W1Error::Timeout),
            Self::TransportGone => Err(W1Error::TransportGone),
            Self::ProgramError => Err(W1Error::ProgramError),
            Self::SequenceError => Err(W1Error::SequenceError),
        }
    }
}

/// Failure of a bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum W1Error {
    /// No device answered the reset. Benign on an empty branch.
    #[error("no device present")]
    NoDevicePresent,
    /// A device signalled an alarm during the presence pulse.
    #[error("alarming presence pulse")]
    AlarmingPresencePulse,
    /// The branch is shorted and has been latched off.
    #[error("bus shorted")]
    BusShorted,
    /// Unexpected data or line state.
    #[error("bus error")]
    BusError,
    /// Checksum or read-back verification failed.
    #[error("crc error")]
    CrcError,
    /// The transport timed out.
    #[error("bus timeout")]
    Timeout,
    /// The transport capability is gone; every device is offline.
    #[error("bus transport gone")]
    TransportGone,
    /// Malformed program. Indicates a defect in program construction.
    #[error("malformed bus program")]
    ProgramError,
    /// Illegal step order. Indicates a defect in program construction.
    #[error("bus program step sequence error")]
    SequenceError,
}

impl W1Error {
    /// Status code carried by this error.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::NoDevicePresent => StatusCode::NoDevicePresent,
            Self::AlarmingPresencePulse => StatusCode::AlarmingPresencePulse,
            Self::BusShorted => StatusCode::BusShorted,
            Self::BusError => StatusCode::BusError,
            Self::CrcError => StatusCode::CrcError,
            Self::Timeout => StatusCode::Timeout,
            Self::TransportGone => StatusCode::TransportGone,
            Self::ProgramError => StatusCode::ProgramError,
            Self::SequenceError => StatusCode::SequenceError,
        }
    }

    /// Errors worth repeating the whole operation for.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::BusError | Self::CrcError | Self::Timeout)
    }

    /// Program-construction defects. Never retried.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::ProgramError | Self::SequenceError)
    }

    /// Errors that end the current work pass instead of just one device.
    #[must_use]
    pub const fn aborts_pass(self) -> bool {
        self.is_fatal() || matches!(self, Self::TransportGone)
    }
}

/// Outcome reported to request-surface callers.
///
/// The bus error taxonomy collapses to these three cases at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RequestError {
    /// The device was not found on the last scan, or the bus is gone.
    #[error("device offline")]
    Offline,
    /// The bus operation failed after retries.
    #[error("bus error")]
    BusError,
    /// A request parameter was out of range or the device family does not
    /// support the request.
    #[error("invalid request")]
    InvalidRequest,
}

impl From<W1Error> for RequestError {
    fn from(error: W1Error) -> Self {
        match error {
            W1Error::TransportGone | W1Error::NoDevicePresent => Self::Offline,
            _ => Self::BusError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestError, StatusCode, W1Error};
    use rstest::rstest;

    #[test]
    fn stable_code_roundtrip_is_bijective_for_defined_values() {
        for code in 0u8..=9 {
            let status = StatusCode::from_u8(code).expect("defined status code");
            assert_eq!(status.as_u8(), code);
        }
        assert!(StatusCode::from_u8(10).is_none());
    }

    #[test]
    fn every_error_maps_back_to_its_status() {
        for code in 1u8..=9 {
            let status = StatusCode::from_u8(code).expect("defined status code");
            let error = status.into_result().expect_err("non-ok status");
            assert_eq!(error.status(), status);
        }
        assert_eq!(StatusCode::Ok.into_result(), Ok(()));
    }

    #[rstest]
    #[case(W1Error::BusError, true, false, false)]
    #[case(W1Error::CrcError, true, false, false)]
    #[case(W1Error::Timeout, true, false, false)]
    #[case(W1Error::BusShorted, false, false, false)]
    #[case(W1Error::NoDevicePresent, false, false, false)]
    #[case(W1Error::TransportGone, false, false, true)]
    #[case(W1Error::ProgramError, false, true, true)]
    #[case(W1Error::SequenceError, false, true, true)]
    fn error_classification(
        #[case] error: W1Error,
        #[case] retryable: bool,
        #[case] fatal: bool,
        #[case] aborts: bool,
    ) {
        assert_eq!(error.is_retryable(), retryable);
        assert_eq!(error.is_fatal(), fatal);
        assert_eq!(error.aborts_pass(), aborts);
    }

    #[rstest]
    #[case(W1Error::TransportGone, RequestError::Offline)]
    #[case(W1Error::CrcError, RequestError::BusError)]
    #[case(W1Error::BusShorted, RequestError::BusError)]
    fn request_boundary_collapses_taxonomy(#[case] error: W1Error, #[case] expected: RequestError) {
        assert_eq!(RequestError::from(error), expected);
    }
}
