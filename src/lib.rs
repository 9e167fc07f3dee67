//! A shared-memory packet interface library: two cooperating processes on
//! the same host exchange network packets through lock-free descriptor
//! rings in a common `mmap`ed region, after a handshake over a control
//! socket that negotiates roles and passes the region/interrupt file
//! descriptors out of band.
//!
//! ```text
//! Context::new(None)?
//!     .create_endpoint(EndpointConfig { role: Role::Master, .. }, on_connect, on_disconnect, on_interrupt, ptr)?
//! ```
//!
//! Then drive the handshake and data path with repeated `poll_event` calls,
//! or, with a custom `on_control_fd_update`, by feeding the application's
//! own multiplexer's readiness into `control_fd_handler`.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

mod control;
mod data_path;
mod endpoint;
mod error;
mod queue;
mod reactor;
mod region;
mod ring;
mod wire;

pub mod context;

pub use context::{Context, EndpointDetails, EndpointId};
pub use data_path::Buffer;
pub use endpoint::{EndpointConfig, Mode, Role, State};
pub use error::{Error, Result};
pub use reactor::{FdEvent, OnControlFdUpdate};
