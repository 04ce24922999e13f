/// Bus program step codes understood by the transport.
///
/// A program is a flat byte buffer: each step is its code byte followed by
/// its payload. `WriteBytes` and `ReadBytes` carry a one-byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StepCode {
    /// Reset pulse without strong pull-up or speed change.
    ResetSimple = 0x01,
    /// Reset pulse at normal speed, used when probing the root.
    ResetNormal = 0x02,
    /// Match the coupler ROM that follows and smart-on its main branch.
    SetPathMain = 0x03,
    /// Match the coupler ROM that follows and smart-on its aux branch.
    SetPathAux = 0x04,
    /// Select the device whose ROM follows.
    MatchRom = 0x05,
    /// One search pass seeded by the ROM that follows. Yields 16 bytes:
    /// the ROM found and the discrepancy mask.
    SearchRom = 0x06,
    /// Select every device in scope.
    SkipRom = 0x07,
    /// Write the counted bytes that follow.
    WriteBytes = 0x08,
    /// Read the counted number of bytes.
    ReadBytes = 0x09,
}

/// Length in bytes of the response to a `SearchRom` step.
pub const SEARCH_RESPONSE_LEN: usize = 16;

/// Fixed payload sizes in bytes. Count-prefixed steps list only the count.
pub const STEP_PAYLOAD_TABLE: &[(StepCode, usize)] = &[
    (StepCode::ResetSimple, 0),
    (StepCode::ResetNormal, 0),
    (StepCode::SetPathMain, 8),
    (StepCode::SetPathAux, 8),
    (StepCode::MatchRom, 8),
    (StepCode::SearchRom, 8),
    (StepCode::SkipRom, 0),
    (StepCode::WriteBytes, 1),
    (StepCode::ReadBytes, 1),
];

impl StepCode {
    /// Stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a step code byte.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ResetSimple),
            0x02 => Some(Self::ResetNormal),
            0x03 => Some(Self::SetPathMain),
            0x04 => Some(Self::SetPathAux),
            0x05 => Some(Self::MatchRom),
            0x06 => Some(Self::SearchRom),
            0x07 => Some(Self::SkipRom),
            0x08 => Some(Self::WriteBytes),
            0x09 => Some(Self::ReadBytes),
            _ => None,
        }
    }

    /// Fixed payload bytes following the code byte.
    #[must_use]
    pub fn payload_len(self) -> usize {
        STEP_PAYLOAD_TABLE
            .iter()
            .find(|(code, _)| *code == self)
            .map_or(0, |(_, len)| *len)
    }

    /// Returns `true` for the two reset steps.
    #[must_use]
    pub const fn is_reset(self) -> bool {
        matches!(self, Self::ResetSimple | Self::ResetNormal)
    }
}

#[cfg(test)]
mod tests {
    use super::{StepCode, STEP_PAYLOAD_TABLE};

    #[test]
    fn table_covers_every_step_once() {
        for code in 0x01u8..=0x09 {
            let step = StepCode::from_u8(code).expect("defined step");
            assert_eq!(step.as_u8(), code);
            let rows = STEP_PAYLOAD_TABLE.iter().filter(|(s, _)| *s == step).count();
            assert_eq!(rows, 1, "{step:?}");
        }
        assert!(StepCode::from_u8(0x00).is_none());
        assert!(StepCode::from_u8(0x0A).is_none());
    }

    #[test]
    fn rom_carrying_steps_have_eight_byte_payloads() {
        assert_eq!(StepCode::MatchRom.payload_len(), 8);
        assert_eq!(StepCode::SetPathAux.payload_len(), 8);
        assert_eq!(StepCode::SkipRom.payload_len(), 0);
    }
}
