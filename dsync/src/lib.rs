//! Chunked directory synchronization - `dsync` (client) and `dsyncd` (session server)
//!
//! `dsync` makes a directory on one host look like a directory on another host while moving as
//! few bytes as possible. Files are split into fixed-size chunks; when both sides already have a
//! file, per-chunk digests are compared and only differing chunks travel over the wire.
//!
//! # Tools
//!
//! ## dsyncd - Session Server
//!
//! ```bash
//! # listen on a random port, require a generated token
//! dsyncd --generate-auth --port 0
//! ```
//!
//! Once listening, `dsyncd` prints `DSYNCD_TCP <address>` to stderr.
//!
//! ## dsync - Client
//!
//! ```bash
//! # pull /srv/data from the server into ./data
//! dsync --server host:7000 --mode download --local ./data --remote /srv/data --summary
//!
//! # push ./data to the server, removing files that don't exist locally
//! dsync --server host:7000 --mode upload --local ./data --remote /srv/data --delete-unexpected
//!
//! # no --server: both directories are local, sessions run in-process
//! dsync --mode download --local /backup/data --remote /srv/data
//! ```
//!
//! # Architecture
//!
//! The server side is a [`registry::SessionRegistry`] owning
//! [`session::download::DownloadSession`]s and [`session::upload::UploadSession`]s. Each session
//! owns per-file sessions, which own a [`common::file_pool::RandomAccessFilePool`] over exactly
//! one file.
//!
//! The client side is an executor ([`executor::download::DownloadExecutor`] or
//! [`executor::upload::UploadExecutor`]) driving the remote side through the traits in
//! [`remote::session`]. [`server`] exposes a registry over TCP; [`local::LocalClient`] exposes it
//! in-process.
//!
//! Per file, [`decision::decide`] chooses between skipping, fixing metadata only, and transferring
//! (fully or only the chunks whose digests differ).

pub mod auth;
pub mod decision;
pub mod executor;
pub mod local;
pub mod registry;
pub mod server;
pub mod session;
pub mod unexpected;

pub use auth::Authenticator;
pub use executor::{AbortHook, download::DownloadExecutor, upload::UploadExecutor};
pub use local::LocalClient;
pub use registry::{RegistryConfig, SessionRegistry};
