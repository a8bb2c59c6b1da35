//! rpc-proto - service descriptor parsing and the message codec contract.
//!
//! A `.proto` file flows through [`parse_file`] into a [`MethodTable`]:
//! one record per `rpc` declaration, carrying the wire-level method path
//! and the request/response descriptors resolved against a [`ProtoCodec`].
//! The codec is the seam to the host's Protocol Buffer runtime; the
//! bundled [`DynamicCodec`] is a self-contained implementation good enough
//! for scalar messages, used by tests and by hosts without a protobuf
//! stack of their own.

mod codec;
mod dynamic;
mod error;
mod parser;
mod table;
mod token;
pub mod wire;

pub use codec::{CodecError, ProtoCodec};
pub use dynamic::{DynamicCodec, DynamicMessage, FieldKind, MessageDescriptor, Value};
pub use error::ProtoError;
pub use parser::{parse_file, parse_source};
pub use table::{MethodRecord, MethodTable};
