//! A TCP server that probes its peers with a heartbeat, and a client that
//! drains a queue of messages onto one connection.
//!
//! Both sides run on a single-threaded tokio runtime. Payloads are opaque
//! bytes with no framing. Each module covers one concern:
//!
//! - [`net`] binds and connects sockets with address reuse enabled and reads
//!   bounded chunks.
//! - [`registry`] tracks the server's live connections and broadcasts to them.
//! - [`heartbeat`] sends `PING` to every live connection on a fixed interval.
//! - [`server`] accepts connections and runs one receive loop per peer.
//! - [`client`] runs the outbound queue's send loop and a receive loop.
//! - [`runtime`] owns shutdown: a cancellation token handed to every task and
//!   a tracker that waits for them to exit.
//! - [`cli`] parses the command line for the `tcp-heartbeat` binary.

pub mod cli;
pub mod client;
pub mod heartbeat;
pub mod net;
pub mod registry;
pub mod runtime;
pub mod server;
