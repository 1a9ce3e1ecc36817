//! # PMAC Remote Client Library
//!
//! Protocol client for Delta-Tau Turbo PMAC and Power PMAC motion controllers. A
//! single [`CommandChannel`] sends commands and reads replies over whichever
//! physical link the controller is reachable on, serialising every exchange
//! through a per-connection guard so foreground commands, batch downloads and
//! the background status poller never interleave on the wire.
//!
//! The library emits `tracing` events (wire traffic at `debug`, timeouts and
//! discarded input at `warn`, device `ERRnnn` codes at `error`); installing a
//! subscriber is left to the application.
//!
//! ## Crate Structure
//!
//! - **`addressing`**: Pure axis and MACRO-station arithmetic (I-variable bases,
//!   station lookup, MACRO IC axis counting).
//! - **`channel`**: The `CommandChannel` façade: `send_command`, `send_series`,
//!   model detection, I-variable helpers and motion commands.
//! - **`config`**: `ConnectionConfig`, loaded from TOML and `PMAC_*` environment
//!   variables with `figment`.
//! - **`error`**: The crate-wide `PmacError` enum and `PmacResult` alias.
//! - **`error_codes`**: Descriptions of the controller's `ERR001`..`ERR019` codes.
//! - **`guard`**: `ConnectionGuard`, a single-holder lock with RAII permits.
//! - **`model`**: Controller identity codes and model names.
//! - **`poller`**: `StatusPoller`, a background loop publishing status snapshots.
//! - **`transport`**: The `Transport` trait and its Ethernet, Telnet, serial and
//!   SSH/gpascii implementations.

pub mod addressing;
pub mod channel;
pub mod config;
pub mod error;
pub mod error_codes;
pub mod guard;
pub mod model;
pub mod poller;
pub mod transport;

pub use channel::{CommandChannel, CommandResult, JogDirection, MotionResult, SeriesLine};
pub use config::{ConnectionConfig, TransportKind};
pub use error::{PmacError, PmacResult};
pub use guard::{ConnectionGuard, GuardPermit};
pub use model::ControllerFamily;
pub use poller::{StatusPoller, StatusSnapshot};
pub use transport::Transport;
