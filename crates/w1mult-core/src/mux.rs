//! The bus multiplexer engine.
//!
//! [`Multiplexer`] ties the device arena, the scheduler and the family
//! handlers to one bus transport. It is driven from a single thread: the
//! caller runs [`Multiplexer::poll`] whenever the wake time it returned has
//! passed, and serves requests between polls.

use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{ConfigError, DeviceConfig};
use crate::devices::{adc, battery, init_found, pio, thermometer, Rosters};
use crate::logstore::LogStore;
use crate::program::{BusConfig, Transport};
use crate::request::{Reply, Request};
use crate::rom::DeviceKind;
use crate::scheduler::{Scheduler, TimerAction};
use crate::status::{RequestError, W1Error};
use crate::topology::{scan_bus, Bus, DeviceId, Network};

/// Failure that stops the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A bus program was rejected as malformed or out of sequence.
    #[error("bus program defect: {0}")]
    ProgramDefect(W1Error),
}

/// One bus with its devices, schedule and log store.
pub struct Multiplexer<L> {
    bus: Bus,
    scheduler: Scheduler,
    rosters: Rosters,
    logs: L,
    config: BusConfig,
}

impl<L> std::fmt::Debug for Multiplexer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("bus", &self.bus)
            .field("scheduler", &self.scheduler)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<L: LogStore> Multiplexer<L> {
    /// Engine for the configured topology, waiting for a transport.
    ///
    /// # Errors
    ///
    /// The configuration does not describe a valid bus.
    pub fn new(
        devices: &[DeviceConfig],
        clock: Box<dyn Clock>,
        logs: L,
    ) -> Result<Self, ConfigError> {
        let net = Network::from_config(devices)?;
        Ok(Self {
            bus: Bus::new(net, clock),
            scheduler: Scheduler::new(),
            rosters: Rosters::default(),
            logs,
            config: BusConfig::default(),
        })
    }

    /// Uses `config` for every rescan.
    #[must_use]
    pub const fn with_bus_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Takes `transport` as the bus, scans it and runs the first heartbeat.
    ///
    /// # Errors
    ///
    /// Only [`EngineError::ProgramDefect`].
    pub fn register_bus(&mut self, transport: Box<dyn Transport>) -> Result<(), EngineError> {
        info!(target: "w1mult::bus", "bus transport registered");
        self.bus.attach(transport);
        self.rescan()
    }

    /// Full rescan: forgets in-flight work and latched shorts, searches the
    /// whole tree, initialises the devices found and restarts the heartbeat
    /// at tick 0.
    ///
    /// A scan that fails with bus errors leaves the devices it did not reach
    /// offline; the heartbeat still restarts.
    ///
    /// # Errors
    ///
    /// Only [`EngineError::ProgramDefect`].
    pub fn rescan(&mut self) -> Result<(), EngineError> {
        self.rosters.abandon();
        match scan_bus(&mut self.bus, &self.config) {
            Ok(report) => {
                if report.root_shorted {
                    error!(target: "w1mult::bus", "bus root is shorted, nothing to sample");
                }
                for id in report.found {
                    if let Err(error) = init_found(&mut self.bus, &mut self.rosters, id) {
                        return self.settle(error);
                    }
                }
            }
            Err(W1Error::TransportGone) => return self.settle(W1Error::TransportGone),
            Err(error) => self.settle(error)?,
        }
        let now = self.bus.now();
        self.scheduler.bus_ready(now);
        self.heartbeat()
    }

    /// Runs every timer due now. Returns when the next one is due, or
    /// `None` while waiting for a transport.
    ///
    /// # Errors
    ///
    /// Only [`EngineError::ProgramDefect`].
    pub fn poll(&mut self) -> Result<Option<Duration>, EngineError> {
        while let Some(timer) = self.scheduler.pop_due(self.bus.now()) {
            debug!(target: "w1mult::doall", "timer {:?} due at {:?}", timer.action, timer.wake);
            match timer.action {
                TimerAction::Heartbeat => self.heartbeat()?,
                TimerAction::ReadThermometers => {
                    let result = thermometer::read_results(
                        &mut self.bus,
                        &mut self.rosters.thermometers,
                        &mut self.logs,
                        &mut self.scheduler,
                    );
                    if let Err(error) = result {
                        self.settle(error)?;
                    }
                }
                TimerAction::ReadAdConverters => {
                    let result = adc::read_results(
                        &mut self.bus,
                        &mut self.rosters.ad_converters,
                        &mut self.logs,
                        &mut self.scheduler,
                    );
                    if let Err(error) = result {
                        self.settle(error)?;
                    }
                }
            }
        }
        Ok(self.scheduler.next_wake())
    }

    /// One heartbeat: battery monitors synchronously, then the conversions
    /// of thermometers and A/D converters.
    fn heartbeat(&mut self) -> Result<(), EngineError> {
        let tick = self.scheduler.begin_heartbeat(self.bus.now());
        debug!(target: "w1mult::doall", "heartbeat {tick}");
        let result = battery::heartbeat(
            &mut self.bus,
            &mut self.rosters.batteries,
            &mut self.logs,
            tick,
        )
        .and_then(|()| {
            thermometer::heartbeat(
                &mut self.bus,
                &mut self.rosters.thermometers,
                &mut self.scheduler,
                tick,
            )
        })
        .and_then(|()| {
            adc::heartbeat(
                &mut self.bus,
                &mut self.rosters.ad_converters,
                &mut self.scheduler,
                tick,
            )
        });
        if let Err(error) = result {
            self.settle(error)?;
        }
        self.scheduler.enable_heartbeat();
        Ok(())
    }

    /// Disposes of an error that ended a pass.
    fn settle(&mut self, error: W1Error) -> Result<(), EngineError> {
        if error == W1Error::TransportGone {
            self.bus_lost();
            Ok(())
        } else if error.is_fatal() {
            error!(target: "w1mult::bus", "stopping on {error}");
            Err(EngineError::ProgramDefect(error))
        } else {
            warn!(target: "w1mult::bus", "pass ended early: {error}");
            Ok(())
        }
    }

    fn bus_lost(&mut self) {
        error!(target: "w1mult::bus", "bus transport gone, every device is offline");
        self.bus.detach();
        self.bus.net_mut().mark_all_lost();
        self.scheduler.bus_lost();
        self.rosters.abandon();
    }

    /// Serves a request for the device at configuration `index`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for an unknown index, a request of another family
    /// or a parameter out of range; `Offline` or `BusError` from the device.
    pub fn request(&mut self, index: usize, request: Request) -> Result<Reply, RequestError> {
        let id = DeviceId(index);
        let Some(device) = self.bus.net().get(id) else {
            return Err(RequestError::InvalidRequest);
        };
        let result = match (request, device.family.kind()) {
            (Request::GetType, kind) => Ok(Reply::Type(kind)),
            (Request::Thermometer(request), DeviceKind::Thermometer) => thermometer::request(
                &mut self.bus,
                &mut self.rosters.thermometers,
                &mut self.logs,
                id,
                request,
            ),
            (Request::Battery(request), DeviceKind::BatteryMonitor) => battery::request(
                &mut self.bus,
                &mut self.rosters.batteries,
                &mut self.logs,
                id,
                request,
            ),
            (Request::AdConverter(request), DeviceKind::AdConverter) => adc::request(
                &mut self.bus,
                &mut self.rosters.ad_converters,
                &mut self.logs,
                id,
                request,
            ),
            (Request::Pio(request), DeviceKind::PioOutputs) => {
                pio::request(&mut self.bus, id, request)
            }
            _ => Err(RequestError::InvalidRequest),
        };
        if self.scheduler.has_bus() && !self.bus.is_attached() {
            self.bus_lost();
        }
        result
    }

    /// The configured devices and what is known about them.
    #[must_use]
    pub const fn network(&self) -> &Network {
        self.bus.net()
    }

    /// Heartbeat and timer state.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The log store.
    #[must_use]
    pub const fn logs(&self) -> &L {
        &self.logs
    }

    /// Mutable log store.
    pub const fn logs_mut(&mut self) -> &mut L {
        &mut self.logs
    }

    /// Bus programs submitted so far.
    #[must_use]
    pub const fn transactions(&self) -> u64 {
        self.bus.transactions()
    }

    /// Current engine time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.bus.now()
    }
}
