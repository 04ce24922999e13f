//! Core engine of the w1mult tree-bus multiplexer.

/// CRC-8 and CRC-16 as used on the wire.
pub mod crc;
pub use crc::{crc16, crc8, crc8_update, Crc16};

/// Wire status codes and error taxonomy.
pub mod status;
pub use status::{RequestError, StatusCode, W1Error};

/// ROM ids and family codes.
pub mod rom;
pub use rom::{
    DeviceKind, Rom, FAMILY_AD_CONVERTER, FAMILY_BATTERY_MONITOR, FAMILY_COUPLER,
    FAMILY_PIO_OUTPUTS, FAMILY_THERMOMETER,
};

/// Bus programs, step codes and the transport contract.
pub mod program;
pub use program::{
    BusConfig, Completion, Executor, PostAction, PostItem, Program, Speed, StepCode, Transport,
    TransportReply,
};

/// Time source for timers and busy waits.
pub mod clock;
pub use clock::{Clock, ManualClock, MonotonicClock};

/// Bounded retry of verified register operations.
pub mod retry;
pub use retry::{with_retries, MAX_TRIES};

/// Log store boundary and hysteresis filtering.
pub mod logstore;
pub use logstore::{
    Hysteresis, LogError, LogHandle, LogRecord, LogSlot, LogStore, MemoryLogStore,
};

/// Branch tree, discovery and switch-minimising work passes.
pub mod topology;
pub use topology::{
    ActiveBranch, Branch, BranchId, Bus, BranchWork, Device, DeviceId, EachDevice, Network,
    ScanReport, Side,
};

/// Heartbeat gating, timers and sampling queues.
pub mod scheduler;
pub use scheduler::{
    HeartbeatHold, PendingReasons, Reason, SamplingQueue, Scheduler, Timer, TimerAction,
    HEARTBEAT_INTERVAL, MAX_LOG2_SECONDS,
};

/// Device families and protocol handlers.
pub mod devices;
pub use devices::{Family, Sample};

/// Per-device requests and replies.
pub mod request;
pub use request::{Reply, Request};

/// Static topology configuration.
pub mod config;
pub use config::{ConfigError, DeviceConfig, MAX_DEVICES};

/// The engine driving one bus.
pub mod mux;
pub use mux::{EngineError, Multiplexer};

/// In-process bus simulator.
pub mod sim;
pub use sim::SimBus;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
