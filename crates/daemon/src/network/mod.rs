//! Chat transports.
//!
//! - [`matrix`]: Matrix client-server API over HTTPS
//! - [`console`]: stdin/stdout, for local use

pub mod console;
pub mod matrix;

pub use console::{ConsoleTransport, CONSOLE_ROOM};
pub use matrix::MatrixTransport;
