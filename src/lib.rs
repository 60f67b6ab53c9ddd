//! # Railbus
//!
//! A hardware-in-the-loop test harness for train onboard control systems
//! (OBIS), bridging the unit under test to scripted test scenarios over
//! stream sockets, datagram sockets, and serial byte-stream links.
//!
//! ## Features
//!
//! - **Protocol bridging**: binary message framing with CRC-16 validation for
//!   the CCU control dialogue and PIAES telegram families
//! - **Serial reassembly**: inter-byte-silence frame detection for links with
//!   no out-of-band delimiter
//! - **Publish/subscribe bus**: in-process callback bus and cross-process TCP
//!   channels with identical ordering and snapshot semantics
//! - **Scenario scheduling**: deadline-ordered timed steps interleaved with
//!   I/O callbacks on one cooperative loop
//!
//! ## Quick Start
//!
//! ```no_run
//! use railbus::scheduler::ScenarioScheduler;
//!
//! # async fn demo() {
//! let mut scheduler = ScenarioScheduler::new();
//! scheduler
//!     .add_step("00:00.5", |_| println!("half a second in"))
//!     .unwrap();
//! scheduler.play().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! One dispatcher process per bridged link copies messages between the
//! transport and its command/telemetry bus channels; scenario processes drive
//! the system under test through simulator interfaces watched by the
//! scheduler. The modules:
//!
//! - [`protocol`] - typed wire messages, checksums, and codecs
//! - [`framing`] - frame boundary detection per transport discipline
//! - [`session`] - transport session lifecycle
//! - [`dispatcher`] - the bridge reactor
//! - [`bus`] / [`netbus`] - in-process and cross-process publish/subscribe
//! - [`scheduler`] - the timed scenario executor
//! - [`simulator`] - scenario-side subsystem interfaces
//! - [`bench`] - test bench assembly and the relay driver boundary
//! - [`config`] - bridge process configuration

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)]
#![allow(clippy::needless_range_loop)]

pub mod bench;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod framing;
pub mod netbus;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod simulator;

// Re-export the main public types for convenience
pub use bus::Bus;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use netbus::Envelope;
pub use protocol::{Message, ProtocolFamily};
pub use scheduler::ScenarioScheduler;
pub use simulator::SimulatorInterface;
