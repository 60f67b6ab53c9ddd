//! Scenario-side interface to one bridged subsystem.
//!
//! A `SimulatorInterface` is the scenario's view of a dispatcher process: it
//! publishes commands on the subsystem's command channel and dispatches
//! telemetry from the subsystem's feed to callbacks keyed by message tag.
//! The feed itself lives in the scenario scheduler's multiplexer, so
//! callbacks fire from within the running scenario loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::{debug, info};

use crate::netbus::{BusError, Envelope, PubEndpoint, SubEndpoint};
use crate::protocol::Message;
use crate::scheduler::{ScenarioScheduler, SourceId, WatchedSource};

type MessageCallback = Rc<RefCell<dyn FnMut(&Message)>>;

/// Command publisher plus tag-keyed telemetry callback registry for one
/// bridged subsystem.
pub struct SimulatorInterface {
    name: String,
    command_topic: String,
    commands: PubEndpoint,
    callbacks: HashMap<u16, Vec<MessageCallback>>,
}

impl SimulatorInterface {
    /// Connect to a dispatcher's channel pair. Returns the interface and the
    /// telemetry feed; hand the feed to [`SimulatorInterface::attach`] to wire
    /// it into a scheduler.
    pub async fn connect(
        name: &str,
        command_addr: SocketAddr,
        telemetry_addr: SocketAddr,
    ) -> Result<(Rc<RefCell<Self>>, SubEndpoint), BusError> {
        let commands = PubEndpoint::connect(command_addr).await?;
        let feed = SubEndpoint::connect(telemetry_addr).await?;
        info!(name, %command_addr, %telemetry_addr, "simulator interface connected");
        let interface = Rc::new(RefCell::new(Self {
            name: name.to_string(),
            command_topic: format!("{name}/cmd"),
            commands,
            callbacks: HashMap::new(),
        }));
        Ok((interface, feed))
    }

    /// Register the telemetry feed with the scheduler's multiplexer. Each
    /// buffered envelope is dispatched through the interface's callbacks.
    pub fn attach(
        interface: &Rc<RefCell<Self>>,
        feed: SubEndpoint,
        scheduler: &mut ScenarioScheduler,
    ) -> SourceId {
        let handle = Rc::clone(interface);
        scheduler.add_socket(WatchedSource::Feed(feed), move |source, _scheduler| {
            let Some(feed) = source.as_feed_mut() else {
                return;
            };
            let mut inbound = Vec::new();
            while let Some(envelope) = feed.try_next() {
                inbound.push(envelope);
            }
            for envelope in inbound {
                Self::deliver(&handle, &envelope.message);
            }
        })
    }

    /// Install a callback for messages carrying `tag`. Insertion order is
    /// preserved; duplicates are allowed.
    pub fn set_callback(&mut self, tag: u16, callback: impl FnMut(&Message) + 'static) {
        self.callbacks
            .entry(tag)
            .or_default()
            .push(Rc::new(RefCell::new(callback)));
    }

    /// Invoke the callbacks registered for this message's tag. The callback
    /// list is snapshotted first, so callbacks may mutate the registry (and
    /// use the interface) freely.
    pub fn deliver(interface: &Rc<RefCell<Self>>, message: &Message) {
        let snapshot: Vec<MessageCallback> = {
            let this = interface.borrow();
            match this.callbacks.get(&message.tag()) {
                Some(callbacks) => callbacks.iter().map(Rc::clone).collect(),
                None => {
                    debug!(name = %this.name, tag = message.tag(), "telemetry without callback");
                    return;
                }
            }
        };
        for callback in snapshot {
            (callback.borrow_mut())(message);
        }
    }

    /// Publish a command for the dispatcher to encode and write to its link.
    pub fn send(&self, message: Message) -> Result<(), BusError> {
        debug!(name = %self.name, tag = message.tag(), "sending command");
        self.commands.publish(&Envelope::new(self.command_topic.clone(), message))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
