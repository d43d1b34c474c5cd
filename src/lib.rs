//! hoprelay - multi-protocol forwarding proxy
//!
//! Listens on a single TCP port, auto-detects whether each connection
//! speaks plain HTTP/1.x, HTTP CONNECT, or SOCKS5, and relays the
//! traffic through an upstream proxy picked from a dynamically managed
//! pool. The pool is fed by plain-text list files that may be edited at
//! runtime and is kept healthy by a background prober.
//!
//! # Architecture
//!
//! ```text
//!              +-----------------+
//!              |  inbound/ (TCP) |
//!              |  demultiplexer  |
//!              +--------+--------+
//!                       |
//!        +--------------+--------------+
//!        |              |              |
//! +------v-----+ +------v-----+ +-----v------+
//! |    HTTP    | |  CONNECT   | |   SOCKS5   |
//! |   bridge   | |   bridge   | |   bridge   |
//! +------+-----+ +------+-----+ +-----+------+
//!        |              |             |
//!        +--------------+-------------+
//!                       |
//!              +--------v--------+      +-----------+
//!              |      pool/      |<-----|  loader / |
//!              | select + health |      |  watcher  |
//!              +--------+--------+      +-----------+
//!                       |
//!              +--------v--------+
//!              |    outbound/    |
//!              | upstream dialer |
//!              +-----------------+
//! ```

pub mod common;
pub mod inbound;
pub mod outbound;
pub mod pool;

pub use common::error::{Error, Result};
