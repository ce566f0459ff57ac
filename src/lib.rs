//! Multi-reactor async network runtime core.
//!
//! A small number of OS threads ("reactors") each run a single-threaded
//! event loop combining kernel I/O readiness polling with an in-process
//! task queue and a delay-timer heap. Sockets, timers, and arbitrary
//! callbacks are all registered against one reactor and only ever driven
//! from that reactor's thread; cross-thread interaction happens by posting
//! a task and waking the reactor through its self-pipe.
//!
//! A separate, plain [`core::worker`] pool exists for CPU-bound or blocking
//! work that should not run on a reactor thread.
#[macro_use]
extern crate tracing;

pub mod core;
pub mod error;
pub mod net;

pub use crate::error::{CoreError, ErrorCode};

pub use crate::core::{
    config::RuntimeConfig,
    load::LoadCounter,
    pool::ReactorPool,
    reactor::{Reactor, ReactorHandle},
    task::{DelayTaskHandle, Task, TaskHandle},
    worker::WorkerPool,
};
pub use crate::net::{
    resolve::resolve_host,
    sendq::{BufferList, BufferOffset, OutBuffer},
    socket::AsyncSocket,
    timer::Timer,
};
