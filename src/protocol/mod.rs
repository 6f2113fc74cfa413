//! Offload session protocol.
//!
//! An edge device streams [`Fragment`]s tagged with [`Action`] flags. Each
//! fragment belongs to a session keyed by an opaque id; the server folds the
//! fragments of a session into an assembled payload and answers INFERENCE
//! requests with a [`Response`].
//!
//! ## Message Flow
//!
//! ```text
//! Edge                                   Server
//!  |                                       |
//!  |-- {id, RESET, chunk0} --------------->|  new buffer = [chunk0]
//!  |-- {id, -, chunk1} ------------------->|  buffer = [chunk0, chunk1]
//!  |-- {id, APPEND|COMPRESSED, chunk2} --->|  payload = unpack(c0‖c1‖c2)
//!  |-- {id, INFERENCE, layer=k} ---------->|  model.predict(payload, k)
//!  |<-------------- {id, results, keypairs}|
//!  |-- {id, END} ------------------------->|  session dropped
//! ```
//!
//! ## State Machine
//!
//! | State          | Description                        | Valid Transitions              |
//! |----------------|------------------------------------|--------------------------------|
//! | `Empty`        | Session created, nothing buffered  | → Accumulating, Assembled, Done |
//! | `Accumulating` | Chunks buffered, not assembled     | → Assembled, Done              |
//! | `Assembled`    | Payload ready for inference        | → Accumulating, Done           |
//! | `Done`         | Terminated by END                  | (terminal)                     |
//!
//! RESET moves any live state back to `Accumulating` with an empty buffer.
//! INFERENCE never changes state; outside `Assembled` it fails with
//! [`OffloadError::InvalidState`](crate::error::OffloadError::InvalidState).
//!
//! ## Compression
//!
//! `COMPRESSED` refers to the *assembled payload*, never to single chunks.
//! With APPEND the payload is decompressed once at assembly. With INFERENCE
//! alone, a payload assembled without decompression is unpacked into a
//! temporary copy for that model run.

mod action;
mod message;
mod reassembler;
mod session;
pub mod varint;

pub use action::{Action, ActionSet, Step};
pub use message::{Fragment, Response, ERROR_KEY, FRAGMENT_TAG, RESPONSE_TAG, TIMEOUT_CODE};
pub use reassembler::ChunkBuffer;
pub use session::{Applied, InferenceBackend, InferenceOutput, Session, SessionState, SessionStats};

/// Protocol version
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default idle time before a session is evicted (5 minutes)
pub const SESSION_TIMEOUT_SECS: u64 = 300;
