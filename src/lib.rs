//! wsferry library
//!
//! Client-side engines for a WebSocket file server: a request channel that
//! multiplexes JSON calls over one connection, and a server-paced chunked
//! uploader.

pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod source;
pub mod uploader;
pub mod url;
