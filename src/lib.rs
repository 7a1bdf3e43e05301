//! Client-side Modbus TCP/RTU library.
//!
//! Three layers, composable independently:
//! - [`frame`]/[`pdu`] — wire-level codecs for the MBAP (TCP) and CRC16 (RTU) framings and the
//!   ten supported function codes.
//! - [`field`]/[`splitter`]/[`register_view`] — a declarative field model describing named
//!   values scattered across a device's register space, and a splitter that batches them into
//!   the minimum set of read requests.
//! - [`poller`]/[`transport`] — a long-running polling engine that owns one connection per
//!   batch, retries with backoff, and fans decoded values into a bounded channel.
//!
//! [`config`] loads the field model from a JSON/YAML file. [`server`] is a thin collaborator
//! surface (not a production Modbus server) for tests and downstream binaries that need a
//! loopback peer.

pub mod byte_order;
pub mod config;
pub mod constants;
pub mod error;
pub mod field;
pub mod frame;
pub mod pdu;
pub mod poller;
pub mod register_view;
pub mod server;
pub mod splitter;
pub mod transport;

pub use byte_order::ByteOrder;
pub use error::{ModbusError, Result};
pub use field::{Field, FieldType, FieldValue, Protocol};
pub use pdu::{FunctionCode, Request, Response};
pub use poller::{PollResult, Poller, PollerConfig};
pub use splitter::{split, BuilderRequest};
pub use transport::{Client, ClientConfig};
