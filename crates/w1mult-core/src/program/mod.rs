//! Bus program construction and execution.
//!
//! A [`Program`] is built fresh for every transaction, submitted as one
//! atomic unit by the [`Executor`], and then dropped. Post-processing items
//! bound to byte offsets let the topology layer learn how far a partially
//! failed program actually got.

/// Step code table.
pub mod step;
pub use step::{StepCode, SEARCH_RESPONSE_LEN, STEP_PAYLOAD_TABLE};

/// Transport contract and program executor.
pub mod executor;
pub use executor::{BusConfig, Completion, Executor, Speed, Transport, TransportReply};

use crate::rom::Rom;
use crate::status::StatusCode;
use crate::topology::{BranchId, DeviceId, Side};

/// Work to do after a program ran, depending on whether its step ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostAction {
    /// A smart-on selected this coupler branch.
    SmartOn(BranchId),
    /// A direct-on-main command was sent to this coupler; its confirmation
    /// byte sits at `reply` in the response data.
    DirectOnMain {
        /// Coupler that received the command.
        coupler: DeviceId,
        /// Index of the confirmation byte in the response.
        reply: usize,
    },
}

/// A post-processing item: the action fires once the program has executed
/// `offset` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PostItem {
    /// Program length after the step this item belongs to.
    pub offset: usize,
    /// Action to apply.
    pub action: PostAction,
}

/// Append-only instruction buffer with offset-bound post-processing items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    code: Vec<u8>,
    items: Vec<PostItem>,
    reads: usize,
}

impl Program {
    /// Empty program.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            code: Vec::new(),
            items: Vec::new(),
            reads: 0,
        }
    }

    /// Encoded step bytes.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Current encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns `true` when no step has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Registered post-processing items in offset order.
    #[must_use]
    pub fn items(&self) -> &[PostItem] {
        &self.items
    }

    /// Number of response bytes the steps so far will produce.
    #[must_use]
    pub const fn response_len(&self) -> usize {
        self.reads
    }

    /// Discards every step and item.
    pub fn clear(&mut self) {
        self.code.clear();
        self.items.clear();
        self.reads = 0;
    }

    fn push_step(&mut self, step: StepCode) {
        self.code.push(step.as_u8());
    }

    fn push_rom(&mut self, step: StepCode, rom: Rom) {
        self.push_step(step);
        self.code.extend_from_slice(&rom.to_le_bytes());
    }

    /// Appends a simple reset.
    pub fn reset_simple(&mut self) -> &mut Self {
        self.push_step(StepCode::ResetSimple);
        self
    }

    /// Appends a normal-speed reset.
    pub fn reset_normal(&mut self) -> &mut Self {
        self.push_step(StepCode::ResetNormal);
        self
    }

    /// Appends a smart-on of one branch of `coupler`.
    pub fn set_path(&mut self, coupler: Rom, side: Side) -> &mut Self {
        let step = match side {
            Side::Main => StepCode::SetPathMain,
            Side::Aux => StepCode::SetPathAux,
        };
        self.push_rom(step, coupler);
        self
    }

    /// Appends a Match ROM.
    pub fn match_rom(&mut self, rom: Rom) -> &mut Self {
        self.push_rom(StepCode::MatchRom, rom);
        self
    }

    /// Appends one search pass seeded with `seed`.
    pub fn search_rom(&mut self, seed: Rom) -> &mut Self {
        self.push_rom(StepCode::SearchRom, seed);
        self.reads += SEARCH_RESPONSE_LEN;
        self
    }

    /// Appends a Skip ROM.
    pub fn skip_rom(&mut self) -> &mut Self {
        self.push_step(StepCode::SkipRom);
        self
    }

    /// Appends writes of `bytes`, split into count-prefixed steps of at most
    /// 255 bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for chunk in bytes.chunks(usize::from(u8::MAX)) {
            self.push_step(StepCode::WriteBytes);
            self.code
                .push(u8::try_from(chunk.len()).unwrap_or(u8::MAX));
            self.code.extend_from_slice(chunk);
        }
        self
    }

    /// Appends a single-byte write.
    pub fn write_byte(&mut self, byte: u8) -> &mut Self {
        self.write_bytes(&[byte])
    }

    /// Appends a read of `count` bytes.
    pub fn read_bytes(&mut self, count: u8) -> &mut Self {
        self.push_step(StepCode::ReadBytes);
        self.code.push(count);
        self.reads += usize::from(count);
        self
    }

    /// Binds `action` to the step just appended.
    pub fn post(&mut self, action: PostAction) -> &mut Self {
        self.items.push(PostItem {
            offset: self.code.len(),
            action,
        });
        self
    }

    /// Walks the post-processing items against a completion.
    ///
    /// Items whose step finished get [`StatusCode::Ok`]. The first item beyond
    /// the point where execution stopped gets the failure status, and no
    /// later item is reported.
    #[must_use]
    pub fn settle(&self, completion: &Completion) -> Vec<(PostAction, StatusCode)> {
        let mut settled = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if item.offset <= completion.executed {
                settled.push((item.action, StatusCode::Ok));
            } else {
                settled.push((item.action, completion.status));
                break;
            }
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::{Completion, PostAction, Program, StepCode};
    use crate::rom::Rom;
    use crate::status::StatusCode;
    use crate::topology::{BranchId, DeviceId, Side};

    fn completion(status: StatusCode, executed: usize) -> Completion {
        Completion {
            status,
            executed,
            data: Vec::new(),
        }
    }

    #[test]
    fn builder_encodes_steps_and_payloads() {
        let rom = Rom(0x0102_0304_0506_0728);
        let mut program = Program::new();
        program
            .reset_simple()
            .match_rom(rom)
            .write_bytes(&[0x4E, 0x7F])
            .read_bytes(9);

        let mut expected = vec![StepCode::ResetSimple.as_u8(), StepCode::MatchRom.as_u8()];
        expected.extend_from_slice(&rom.to_le_bytes());
        expected.extend_from_slice(&[StepCode::WriteBytes.as_u8(), 2, 0x4E, 0x7F]);
        expected.extend_from_slice(&[StepCode::ReadBytes.as_u8(), 9]);
        assert_eq!(program.code(), expected.as_slice());
        assert_eq!(program.response_len(), 9);
    }

    #[test]
    fn long_writes_are_split_into_counted_chunks() {
        let mut program = Program::new();
        program.write_bytes(&[0xAA; 300]);
        assert_eq!(program.len(), 2 + 255 + 2 + 45);
        assert_eq!(program.code()[1], 255);
        assert_eq!(program.code()[257], 45);
    }

    #[test]
    fn post_items_record_offset_after_their_step() {
        let mut program = Program::new();
        program
            .reset_simple()
            .set_path(Rom(0x1F), Side::Aux)
            .post(PostAction::SmartOn(BranchId::ROOT));
        assert_eq!(program.items()[0].offset, 10);
    }

    #[test]
    fn settle_reports_ok_up_to_the_failure_and_stops() {
        let first = PostAction::SmartOn(BranchId::ROOT);
        let second = PostAction::DirectOnMain {
            coupler: DeviceId(3),
            reply: 0,
        };
        let third = PostAction::SmartOn(BranchId::ROOT);
        let mut program = Program::new();
        program.reset_simple().set_path(Rom(1), Side::Main).post(first);
        program.set_path(Rom(2), Side::Main).post(second);
        program.set_path(Rom(3), Side::Main).post(third);

        let settled = program.settle(&completion(StatusCode::BusShorted, 10));
        assert_eq!(
            settled,
            vec![(first, StatusCode::Ok), (second, StatusCode::BusShorted)]
        );
    }

    #[test]
    fn settle_after_success_reports_every_item_ok() {
        let action = PostAction::SmartOn(BranchId::ROOT);
        let mut program = Program::new();
        program.reset_simple().set_path(Rom(1), Side::Main).post(action);
        let settled = program.settle(&completion(StatusCode::Ok, program.len()));
        assert_eq!(settled, vec![(action, StatusCode::Ok)]);
    }

    #[test]
    fn clear_discards_steps_and_items() {
        let mut program = Program::new();
        program
            .search_rom(Rom(0))
            .post(PostAction::SmartOn(BranchId::ROOT));
        program.clear();
        assert!(program.is_empty());
        assert!(program.items().is_empty());
        assert_eq!(program.response_len(), 0);
    }
}
