//! Logging setup for kiln binaries.
//!
//! Logs go to stderr so stdout stays free for the event stream.

pub mod logging;
