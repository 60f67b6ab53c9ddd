//! Test bench assembly.
//!
//! A bench owns the scenario scheduler, the simulator interfaces for every
//! bridged subsystem, and the relay drivers a scenario flips. Test cases build
//! a bench, register interfaces and steps, then `play`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::info;

use crate::netbus::BusError;
use crate::scheduler::{ScenarioScheduler, SourceId, StepHandle, StepOptions, TimeSpec, TimeSpecError};
use crate::simulator::SimulatorInterface;

/// Boundary to the relay/GPIO hardware scenario steps flip. The device I/O
/// behind it lives outside the harness.
pub trait RelayControl {
    fn open(&mut self, relay: u8) -> std::io::Result<()>;
    fn close(&mut self, relay: u8) -> std::io::Result<()>;
}

/// Relay stand-in that only logs, for benches running without hardware.
pub struct LoggingRelay {
    name: String,
}

impl LoggingRelay {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

impl RelayControl for LoggingRelay {
    fn open(&mut self, relay: u8) -> std::io::Result<()> {
        info!(driver = %self.name, relay, "relay opened");
        Ok(())
    }

    fn close(&mut self, relay: u8) -> std::io::Result<()> {
        info!(driver = %self.name, relay, "relay closed");
        Ok(())
    }
}

/// One test system: scheduler, named simulator interfaces, named relays.
pub struct TestBench {
    name: String,
    pub scheduler: ScenarioScheduler,
    interfaces: HashMap<String, Rc<RefCell<SimulatorInterface>>>,
    sources: HashMap<String, SourceId>,
    relays: HashMap<String, Box<dyn RelayControl>>,
}

impl TestBench {
    pub fn new(name: &str) -> Self {
        info!(bench = name, "test bench starting");
        Self {
            name: name.to_string(),
            scheduler: ScenarioScheduler::new(),
            interfaces: HashMap::new(),
            sources: HashMap::new(),
            relays: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect a simulator interface to a dispatcher's channel pair and wire
    /// its telemetry feed into the scheduler.
    pub async fn add_simulator_interface(
        &mut self,
        name: &str,
        command_addr: SocketAddr,
        telemetry_addr: SocketAddr,
    ) -> Result<Rc<RefCell<SimulatorInterface>>, BusError> {
        let (interface, feed) =
            SimulatorInterface::connect(name, command_addr, telemetry_addr).await?;
        let source = SimulatorInterface::attach(&interface, feed, &mut self.scheduler);
        self.interfaces.insert(name.to_string(), Rc::clone(&interface));
        self.sources.insert(name.to_string(), source);
        Ok(interface)
    }

    pub fn interface(&self, name: &str) -> Option<Rc<RefCell<SimulatorInterface>>> {
        self.interfaces.get(name).map(Rc::clone)
    }

    /// Disconnect an interface's feed from the scheduler and drop it.
    pub fn remove_simulator_interface(&mut self, name: &str) {
        if let Some(source) = self.sources.remove(name) {
            self.scheduler.remove_socket(source);
        }
        self.interfaces.remove(name);
    }

    pub fn add_relay(&mut self, name: &str, relay: Box<dyn RelayControl>) {
        self.relays.insert(name.to_string(), relay);
    }

    pub fn relay(&mut self, name: &str) -> Option<&mut Box<dyn RelayControl>> {
        self.relays.get_mut(name)
    }

    pub fn add_step<W>(
        &mut self,
        when: W,
        action: impl FnMut(&mut ScenarioScheduler) + 'static,
    ) -> Result<StepHandle, TimeSpecError>
    where
        W: TryInto<TimeSpec, Error = TimeSpecError>,
    {
        self.scheduler.add_step(when, action)
    }

    pub fn add_step_with<W>(
        &mut self,
        when: W,
        action: impl FnMut(&mut ScenarioScheduler) + 'static,
        options: StepOptions,
    ) -> Result<StepHandle, TimeSpecError>
    where
        W: TryInto<TimeSpec, Error = TimeSpecError>,
    {
        self.scheduler.add_step_with(when, action, options)
    }

    pub async fn play(&mut self) {
        self.scheduler.play().await;
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
    }
}
