use log::{error, trace};

use crate::status::{StatusCode, W1Error};

use super::Program;

/// Bus speed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Speed {
    /// Standard speed.
    Standard,
    /// Standard speed with programmable slew and timing.
    #[default]
    Flexible,
    /// Overdrive speed.
    Overdrive,
}

/// Electrical parameters applied by a full rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BusConfig {
    /// Speed mode.
    pub speed: Speed,
    /// Pull-down slew rate in hundredths of a volt per microsecond.
    pub pulldown_slew_centivolts_per_us: u16,
    /// Write-one low time in microseconds.
    pub write_one_low_us: u8,
    /// Data sample offset in microseconds.
    pub data_sample_offset_us: u8,
}

impl BusConfig {
    /// Parameters for long lines: flexible speed, 1.37 V/us slew, 11 us
    /// write-one low time, 10 us sample offset.
    #[must_use]
    pub const fn long_line() -> Self {
        Self {
            speed: Speed::Flexible,
            pulldown_slew_centivolts_per_us: 137,
            write_one_low_us: 11,
            data_sample_offset_us: 10,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::long_line()
    }
}

/// Raw answer of the transport to one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReply {
    /// Completion status.
    pub status: StatusCode,
    /// Bytes of the program executed before it stopped.
    pub executed: usize,
    /// Bytes read from the bus.
    pub data: Vec<u8>,
}

/// Physical bus master.
///
/// Implementations must complete every call with a definite status; the
/// engine never has more than one call outstanding.
pub trait Transport {
    /// Resets the bus master itself.
    fn reset(&mut self) -> StatusCode;

    /// Applies speed and pulse timing parameters.
    fn configure(&mut self, config: &BusConfig) -> StatusCode;

    /// Runs one program atomically.
    fn execute(&mut self, program: &[u8]) -> TransportReply;
}

/// Decoded result of a program that reached the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Completion status. Never `TransportGone`, `ProgramError` or
    /// `SequenceError`; those come back as `Err`.
    pub status: StatusCode,
    /// Bytes executed; the full length when the status is OK.
    pub executed: usize,
    /// Bytes read from the bus.
    pub data: Vec<u8>,
}

impl Completion {
    /// Returns the response data when every step ran.
    ///
    /// # Errors
    ///
    /// Returns the completion status as an error when it is not OK.
    pub fn into_data(self) -> Result<Vec<u8>, W1Error> {
        self.status.into_result().map(|()| self.data)
    }
}

/// Submits programs to the current transport.
///
/// Holding no transport means the capability is gone; every run then fails
/// with [`W1Error::TransportGone`] until a new one is attached.
#[derive(Default)]
pub struct Executor {
    transport: Option<Box<dyn Transport>>,
    transactions: u64,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("attached", &self.transport.is_some())
            .field("transactions", &self.transactions)
            .finish()
    }
}

impl Executor {
    /// Executor with no transport attached.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport: None,
            transactions: 0,
        }
    }

    /// Installs a new transport, replacing any previous one.
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    /// Drops the transport.
    pub fn detach(&mut self) {
        self.transport = None;
    }

    /// Returns `true` while a transport is attached.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// Programs submitted since construction.
    #[must_use]
    pub const fn transactions(&self) -> u64 {
        self.transactions
    }

    fn transport(&mut self) -> Result<&mut (dyn Transport + 'static), W1Error> {
        self.transport.as_deref_mut().ok_or(W1Error::TransportGone)
    }

    fn check(&mut self, status: StatusCode) -> Result<(), W1Error> {
        if status == StatusCode::TransportGone {
            self.transport = None;
        }
        status.into_result()
    }

    /// Resets the bus master.
    ///
    /// # Errors
    ///
    /// Returns the transport status when it is not OK.
    pub fn reset_master(&mut self) -> Result<(), W1Error> {
        let status = self.transport()?.reset();
        self.check(status)
    }

    /// Applies bus parameters.
    ///
    /// # Errors
    ///
    /// Returns the transport status when it is not OK.
    pub fn configure(&mut self, config: &BusConfig) -> Result<(), W1Error> {
        let status = self.transport()?.configure(config);
        self.check(status)
    }

    /// Runs `program` as one transaction.
    ///
    /// Data statuses (everything except the three below) come back inside
    /// the [`Completion`] so the caller can settle post-processing items.
    ///
    /// # Errors
    ///
    /// * [`W1Error::TransportGone`] when no transport is attached or it
    ///   disappeared during the call; the transport is dropped.
    /// * [`W1Error::ProgramError`] or [`W1Error::SequenceError`] when the
    ///   program was malformed.
    pub fn run(&mut self, program: &Program) -> Result<Completion, W1Error> {
        let transport = self.transport()?;
        let reply = transport.execute(program.code());
        self.transactions += 1;
        trace!(
            target: "w1mult::bus",
            "program of {} bytes -> {:?} after {} bytes, {} bytes read",
            program.len(),
            reply.status,
            reply.executed,
            reply.data.len()
        );
        match reply.status {
            StatusCode::TransportGone => {
                self.transport = None;
                Err(W1Error::TransportGone)
            }
            StatusCode::ProgramError => {
                error!(target: "w1mult::bus", "malformed program {:02x?}", program.code());
                Err(W1Error::ProgramError)
            }
            StatusCode::SequenceError => {
                error!(target: "w1mult::bus", "step sequence error in {:02x?}", program.code());
                Err(W1Error::SequenceError)
            }
            StatusCode::Ok => Ok(Completion {
                status: StatusCode::Ok,
                executed: program.len(),
                data: reply.data,
            }),
            status => Ok(Completion {
                status,
                executed: reply.executed.min(program.len()),
                data: reply.data,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BusConfig, Executor, Transport, TransportReply};
    use crate::program::Program;
    use crate::status::{StatusCode, W1Error};

    struct StubTransport {
        reply: TransportReply,
        calls: usize,
    }

    impl StubTransport {
        fn replying(status: StatusCode, executed: usize, data: &[u8]) -> Self {
            Self {
                reply: TransportReply {
                    status,
                    executed,
                    data: data.to_vec(),
                },
                calls: 0,
            }
        }
    }

    impl Transport for StubTransport {
        fn reset(&mut self) -> StatusCode {
            self.reply.status
        }

        fn configure(&mut self, _config: &BusConfig) -> StatusCode {
            StatusCode::Ok
        }

        fn execute(&mut self, _program: &[u8]) -> TransportReply {
            self.calls += 1;
            self.reply.clone()
        }
    }

    fn program() -> Program {
        let mut program = Program::new();
        program.reset_simple().skip_rom().write_byte(0x44);
        program
    }

    #[test]
    fn detached_executor_reports_transport_gone() {
        let mut executor = Executor::new();
        assert_eq!(executor.run(&program()), Err(W1Error::TransportGone));
        assert_eq!(executor.transactions(), 0);
    }

    #[test]
    fn ok_status_counts_every_byte_as_executed() {
        let mut executor = Executor::new();
        executor.attach(Box::new(StubTransport::replying(StatusCode::Ok, 0, &[7])));
        let completion = executor.run(&program()).expect("ok completion");
        assert_eq!(completion.executed, program().len());
        assert_eq!(completion.into_data(), Ok(vec![7]));
    }

    #[test]
    fn data_status_keeps_partial_offset() {
        let mut executor = Executor::new();
        executor.attach(Box::new(StubTransport::replying(
            StatusCode::NoDevicePresent,
            0,
            &[],
        )));
        let completion = executor.run(&program()).expect("data status");
        assert_eq!(completion.status, StatusCode::NoDevicePresent);
        assert_eq!(completion.executed, 0);
        assert_eq!(completion.into_data(), Err(W1Error::NoDevicePresent));
    }

    #[test]
    fn vanished_transport_is_dropped() {
        let mut executor = Executor::new();
        executor.attach(Box::new(StubTransport::replying(
            StatusCode::TransportGone,
            0,
            &[],
        )));
        assert_eq!(executor.run(&program()), Err(W1Error::TransportGone));
        assert!(!executor.is_attached());
    }

    #[test]
    fn malformed_program_is_fatal() {
        let mut executor = Executor::new();
        executor.attach(Box::new(StubTransport::replying(
            StatusCode::ProgramError,
            0,
            &[],
        )));
        let error = executor.run(&program()).expect_err("fatal status");
        assert!(error.is_fatal());
        assert!(executor.is_attached());
    }

    #[test]
    fn default_bus_config_is_long_line_timing() {
        let config = BusConfig::default();
        assert_eq!(config.pulldown_slew_centivolts_per_us, 137);
        assert_eq!(config.write_one_low_us, 11);
        assert_eq!(config.data_sample_offset_us, 10);
    }
}
