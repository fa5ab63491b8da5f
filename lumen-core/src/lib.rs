//! # Lumen Core
//!
//! The engine room of the lumen LwM2M client: everything between the
//! application's data model and a UDP socket.
//!
//! Four cooperating engines drive one client↔server session:
//!
//! - **Exchange engine** ([`exchange`]): one CoAP transaction at a time —
//!   request/response correlation, retransmission, block-wise transfer in
//!   both directions and a small replay cache for duplicated server
//!   requests.
//! - **Registration session engine** ([`session`]): the top-level state
//!   machine for bootstrap, registration, update, queue mode, suspension
//!   and deregistration against a single server account.
//! - **Observation engine** ([`observe`]): attribute-driven notification
//!   scheduling (pmin/pmax and value triggers) with composite snapshots.
//! - **Data model mediator** ([`dm`]): a uniform read/write/execute surface
//!   over application-defined objects with per-object transactions.
//!
//! The core is single-threaded and cooperative: all progress happens inside
//! [`session::Session::step`], and [`session::Session::next_step_time`]
//! tells the caller how long it may sleep. Time, randomness and the network
//! are injected capabilities ([`clock::TimeProvider`], [`rand::RngCore`],
//! [`transport::Transport`]); the core holds no global state.

pub mod attr;
pub mod clock;
pub mod codec;
pub mod dm;
pub mod error;
pub mod exchange;
pub mod flat_map;
pub mod observe;
pub mod path;
pub mod persist;
pub mod session;
pub mod testing;
pub mod transport;
pub mod value;

pub use attr::{AttrError, AttrSet, AttrStore};
pub use clock::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use codec::{CodecSet, PayloadDecoder, PayloadEncoder, ResourceSample};
pub use dm::{ChangeKind, DataModel, DmError, ObjectDef, ObjectHandler, WriteMode};
pub use error::{CoreError, CoreResult};
pub use exchange::{ExchangeEngine, ExchangeOutcome, ExchangeStatus};
pub use flat_map::FlatMap;
pub use path::{INVALID_ID, Path};
pub use session::{CommRetryParams, ServerAccount, Session, SessionConfig, SessionState};
pub use transport::{Io, LinkState, Transport, TransportError};
pub use value::{DataType, ResourceDef, ResourceKind, Value};
