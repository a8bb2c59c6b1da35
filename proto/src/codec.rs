//! The message codec contract.
//!
//! The embedding treats Protocol Buffer message handling as an external
//! capability: something that can compile a `.proto` source so its types
//! resolve, hand out opaque descriptors, and move messages between host
//! values and wire bytes. Descriptor equality is the identity used for
//! request-type checks, so implementations must make `==` mean "the same
//! registered message type".

use bytes::Bytes;

/// Codec failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// The compile pass could not process the source.
    #[error("malformed message definition: {0}")]
    Malformed(String),
    /// A construct the codec does not support.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A field name that is not part of the message type.
    #[error("message {message} has no field named {field}")]
    UnknownField { message: String, field: String },
    /// A value whose kind does not match the field's declared kind.
    #[error("field {field} expects {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        got: &'static str,
    },
    /// Wire bytes that do not decode as the target type.
    #[error("cannot decode {message}: {reason}")]
    Decode { message: String, reason: String },
}

/// Capability set the embedding requires from a Protocol Buffer runtime.
pub trait ProtoCodec {
    /// Opaque message-type identity. Equality must hold exactly for the
    /// same registered type.
    type Descriptor: Clone + PartialEq + std::fmt::Debug;
    /// A message value in host terms.
    type Message;
    /// A field value used for named-field construction.
    type Value;

    /// Make the message types defined in `source` resolvable. Called once
    /// per `.proto` file before service parsing; compiling a file twice
    /// must keep existing descriptor identities stable.
    fn compile(&self, source: &str) -> Result<(), CodecError>;

    /// Resolve a fully-qualified (or, for runtimes that registered bare
    /// names, unqualified) message type name.
    fn resolve(&self, name: &str) -> Option<Self::Descriptor>;

    /// The descriptor of a message value.
    fn descriptor(&self, message: &Self::Message) -> Self::Descriptor;

    /// Construct a message of `descriptor` from named fields.
    fn build(
        &self,
        descriptor: &Self::Descriptor,
        fields: &[(&str, Self::Value)],
    ) -> Result<Self::Message, CodecError>;

    /// Serialize a message to wire bytes.
    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;

    /// Deserialize wire bytes as `descriptor`. Empty input must produce
    /// the default instance.
    fn decode(&self, descriptor: &Self::Descriptor, bytes: &[u8]) -> Result<Self::Message, CodecError>;

    /// The default (all-fields-unset) instance of `descriptor`.
    fn default_message(&self, descriptor: &Self::Descriptor) -> Self::Message;
}
