//! Core model shared by every Tidemark subsystem: versionstamps, tuple-encoded
//! keys, the event model and codec, queries, and cooperative cancellation.

pub mod cancel;
pub mod event;
pub mod query;
pub mod registry;
pub mod subspace;
pub mod tuple;
pub mod version;

pub use cancel::CancelToken;
pub use event::{encode_json, CodecError, Event, StoredEvent, UncommittedEvent};
pub use query::{AppendCondition, Query, QueryItem};
pub use registry::EventRegistry;
pub use subspace::Subspace;
pub use tuple::{key_after, pack, pack_with_versionstamp, strinc, unpack, Element, TupleError};
pub use version::{Versionstamp, VersionstampError, VERSIONSTAMP_LEN};
