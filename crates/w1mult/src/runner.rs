use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use w1mult_core::{
    Clock, DeviceConfig, DeviceKind, LogHandle, ManualClock, MemoryLogStore, MonotonicClock,
    Multiplexer, Reason, Reply, SimBus,
};

use crate::config::DaemonConfig;

/// How long to run and which clock to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Heartbeats to complete, counting the one started by the scan.
    pub heartbeats: u32,
    /// Jump a virtual clock to each timer instead of sleeping.
    pub virtual_clock: bool,
}

/// What a run left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    /// Heartbeats begun since the bus came up.
    pub heartbeats: u32,
    /// Bus programs executed.
    pub transactions: u64,
    /// Every configured device in index order.
    pub devices: Vec<DeviceSummary>,
}

/// State of one device at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    /// Configured index.
    pub index: usize,
    /// ROM id.
    pub rom: String,
    /// Device family.
    pub kind: DeviceKind,
    /// Answered the last scan.
    pub found: bool,
    /// Logs opened by the start-up requests.
    pub logs: Vec<LogSummary>,
}

/// Contents of one log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSummary {
    /// Read handle.
    pub handle: u32,
    /// Records written.
    pub records: usize,
    /// Most recent value.
    pub last: Option<i32>,
}

/// Runs the configured bus on the simulator and summarizes the result.
///
/// # Errors
///
/// Fails on an invalid configuration or when the engine stops with a
/// program defect.
pub fn run(config: &DaemonConfig, options: RunOptions) -> Result<Summary> {
    let devices = config.device_configs()?;
    let sim = simulated_bus(config, &devices)?;

    if options.virtual_clock {
        let clock = ManualClock::new();
        let mut mux = Multiplexer::new(&devices, Box::new(clock.clone()), MemoryLogStore::new())
            .context("invalid device configuration")?
            .with_bus_config(config.bus);
        let logs = start(&mut mux, config, sim)?;
        drive(&mut mux, options.heartbeats, |wake| {
            clock.set(wake);
            Ok(())
        })?;
        Ok(summarize(&mux, &logs))
    } else {
        let clock = MonotonicClock::new();
        let mut mux = Multiplexer::new(&devices, Box::new(clock), MemoryLogStore::new())
            .context("invalid device configuration")?
            .with_bus_config(config.bus);
        let logs = start(&mut mux, config, sim)?;
        let waker = Waker::spawn(clock)?;
        let outcome = drive(&mut mux, options.heartbeats, |wake| waker.wait(wake));
        waker.stop()?;
        outcome?;
        Ok(summarize(&mux, &logs))
    }
}

fn simulated_bus(config: &DaemonConfig, devices: &[DeviceConfig]) -> Result<SimBus> {
    let sim = SimBus::from_config(devices);
    let device = |index: usize| {
        devices
            .get(index)
            .map(|config| config.rom)
            .ok_or_else(|| anyhow!("simulation refers to unknown device {index}"))
    };
    for &index in &config.simulation.absent {
        sim.set_present(device(index)?, false);
    }
    for rom in config.stranger_roms()? {
        sim.add_device(rom, None);
    }
    for reading in &config.simulation.readings {
        let rom = device(reading.index)?;
        if let Some(temperature) = reading.temperature {
            sim.set_temperature(rom, temperature);
        }
        if let Some([vad, vdd]) = reading.voltages {
            sim.set_voltages(rom, vad, vdd);
        }
        if let Some(inputs) = reading.inputs {
            sim.set_ad_inputs(rom, inputs);
        }
    }
    Ok(sim)
}

/// Registers the bus and applies the start-up requests. Returns the log
/// handles each device was given.
fn start(
    mux: &mut Multiplexer<MemoryLogStore>,
    config: &DaemonConfig,
    sim: SimBus,
) -> Result<BTreeMap<usize, Vec<LogHandle>>> {
    mux.register_bus(Box::new(sim)).context("scanning the bus")?;
    let missing = mux.network().missing();
    if missing.is_empty() {
        info!("all {} devices found", mux.network().ids().count());
    } else {
        warn!("{} devices missing: {missing:?}", missing.len());
    }

    let mut logs: BTreeMap<usize, Vec<LogHandle>> = BTreeMap::new();
    for initial in &config.requests {
        match mux.request(initial.index, initial.request.clone()) {
            Ok(Reply::Log(handle)) => logs.entry(initial.index).or_default().push(handle),
            Ok(Reply::PortLogs(ports)) => logs
                .entry(initial.index)
                .or_default()
                .extend(ports.into_iter().flatten()),
            Ok(reply) => debug!("device {}: {reply:?}", initial.index),
            Err(error) => warn!(
                "device {}: start-up request {:?} failed: {error}",
                initial.index, initial.request
            ),
        }
    }
    Ok(logs)
}

/// Polls the engine until `heartbeats` have begun and their conversions have
/// been read. `wait` blocks until the given time.
fn drive(
    mux: &mut Multiplexer<MemoryLogStore>,
    heartbeats: u32,
    mut wait: impl FnMut(Duration) -> Result<()>,
) -> Result<()> {
    loop {
        let next = mux.poll().context("engine stopped")?;
        let scheduler = mux.scheduler();
        let pending = scheduler.pending();
        if scheduler.tick() >= heartbeats
            && !pending.contains(Reason::Thermometer)
            && !pending.contains(Reason::AdConverter)
        {
            return Ok(());
        }
        let Some(wake) = next else {
            warn!("bus transport gone after {} heartbeats", scheduler.tick());
            return Ok(());
        };
        wait(wake)?;
    }
}

fn summarize(
    mux: &Multiplexer<MemoryLogStore>,
    logs: &BTreeMap<usize, Vec<LogHandle>>,
) -> Summary {
    let network = mux.network();
    let devices = network
        .ids()
        .map(|id| {
            let device = network.device(id);
            let logs = logs
                .get(&id.0)
                .into_iter()
                .flatten()
                .map(|&handle| {
                    let records = mux.logs().records(handle);
                    LogSummary {
                        handle: handle.0,
                        records: records.len(),
                        last: records.last().map(|record| record.value),
                    }
                })
                .collect();
            DeviceSummary {
                index: id.0,
                rom: device.rom.to_string(),
                kind: device.family.kind(),
                found: device.found,
                logs,
            }
        })
        .collect();
    Summary {
        heartbeats: mux.scheduler().tick(),
        transactions: mux.transactions(),
        devices,
    }
}

/// Sleeps on a helper thread and posts the wake back, so the engine thread
/// only ever blocks on a channel.
struct Waker {
    deadlines: mpsc::Sender<Duration>,
    wakes: mpsc::Receiver<Duration>,
    thread: thread::JoinHandle<()>,
}

impl Waker {
    fn spawn(clock: MonotonicClock) -> Result<Self> {
        let (deadlines, requested) = mpsc::channel::<Duration>();
        let (woke, wakes) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("w1mult-wake".into())
            .spawn(move || {
                for deadline in requested {
                    clock.sleep_until(deadline);
                    if woke.send(deadline).is_err() {
                        break;
                    }
                }
            })
            .context("spawning the wake thread")?;
        Ok(Self {
            deadlines,
            wakes,
            thread,
        })
    }

    fn wait(&self, wake: Duration) -> Result<()> {
        self.deadlines.send(wake).context("wake thread stopped")?;
        let woke = self.wakes.recv().context("wake thread stopped")?;
        debug!("woke for {woke:?}");
        Ok(())
    }

    fn stop(self) -> Result<()> {
        let Self {
            deadlines,
            wakes,
            thread,
        } = self;
        drop(deadlines);
        drop(wakes);
        thread.join().map_err(|_| anyhow!("wake thread panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use w1mult_core::{Rom, FAMILY_COUPLER, FAMILY_THERMOMETER};

    fn two_thermometers() -> DaemonConfig {
        let coupler = Rom::with_crc(FAMILY_COUPLER, 1);
        let near = Rom::with_crc(FAMILY_THERMOMETER, 2);
        let far = Rom::with_crc(FAMILY_THERMOMETER, 3);
        parse(&format!(
            r#"{{
                "devices": [
                    {{ "rom": "{coupler}" }},
                    {{ "rom": "{near}" }},
                    {{ "rom": "{far}", "parentIndex": 0, "branch": "aux" }}
                ],
                "requests": [
                    {{ "index": 2, "request": {{ "thermometer": {{ "configure":
                        {{ "log2": 0, "resolution": 4, "hysteresis": 0 }} }} }} }}
                ],
                "simulation": {{ "readings": [ {{ "index": 2, "temperature": 345 }} ] }}
            }}"#
        ))
        .expect("valid configuration")
    }

    #[test]
    fn virtual_run_logs_every_heartbeat() {
        let summary = run(
            &two_thermometers(),
            RunOptions {
                heartbeats: 3,
                virtual_clock: true,
            },
        )
        .expect("run completes");

        assert_eq!(summary.heartbeats, 3);
        assert!(summary.devices.iter().all(|device| device.found));
        let far = &summary.devices[2];
        assert_eq!(far.kind, DeviceKind::Thermometer);
        // Configured after the first heartbeat, so sampled on the next two.
        assert_eq!(far.logs.len(), 1);
        assert_eq!(far.logs[0].records, 1);
        assert_eq!(far.logs[0].last, Some(345));
        assert!(summary.devices[1].logs.is_empty());
    }

    #[test]
    fn absent_device_is_reported_missing() {
        let mut config = two_thermometers();
        config.simulation.absent.push(1);
        let summary = run(
            &config,
            RunOptions {
                heartbeats: 1,
                virtual_clock: true,
            },
        )
        .expect("run completes");
        assert!(!summary.devices[1].found);
        assert!(summary.devices[2].found);
    }

    #[test]
    fn simulation_must_name_configured_devices() {
        let mut config = two_thermometers();
        config.simulation.absent.push(9);
        let options = RunOptions {
            heartbeats: 1,
            virtual_clock: true,
        };
        assert!(run(&config, options).is_err());
    }
}
