//! Networking layer between the `dsync` client and the `dsyncd` server
//!
//! - [`protocol`]: request and response messages, and the structured error body
//! - [`streams`]: length-delimited framing with raw data following selected frames
//! - [`session`]: the operations the transfer executors need from the other side, as traits
//! - [`client`]: TCP implementation of those traits with a pool of reusable connections
//!
//! The server side lives with the session registry in the `dsync` crate.

pub mod client;
pub mod protocol;
pub mod session;
pub mod streams;

pub use client::{ClientConfig, TcpClient};
pub use session::{DownloadClient, ListClient, UploadClient};

/// Line printed on stderr by `dsyncd` once it accepts connections, followed by the bound address.
pub const SERVER_READY_PREFIX: &str = "DSYNCD_TCP";
