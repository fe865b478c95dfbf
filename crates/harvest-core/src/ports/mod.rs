//! Ports: the seams between the coordination core and everything it talks to.
//!
//! Storage ports are split by concern even though the bundled stores implement all
//! three on one type; the worker only ever sees a backlog and a sink.

pub mod backlog;
pub mod clock;
pub mod duplicates;
pub mod fetcher;
pub mod launcher;
pub mod result_sink;

pub use self::backlog::BacklogStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::duplicates::DuplicateLedger;
pub use self::fetcher::Fetcher;
pub use self::launcher::{Launcher, WorkerExit};
pub use self::result_sink::ResultSink;
