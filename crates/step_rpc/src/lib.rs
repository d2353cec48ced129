//! Runner protocol library shared by the polystep runtime and its tooling:
//! the newline-delimited JSON frame format, the parameter shapes every
//! language runner speaks, and the parent-side supervisor that owns one
//! worker process and its RPC channel.

pub mod message;
pub mod rpc;
pub mod supervisor;

pub use message::{Envelope, LogEntry, LogLevel};
pub use rpc::{Frame, Method, StreamOp};
pub use supervisor::{ProcessExit, RunnerSupervisor, SupervisorError};
