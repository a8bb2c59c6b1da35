//! Client stubs generated from a method table.
//!
//! A [`StubSet`] binds a parsed table to one channel and a codec; each
//! method yields a [`MethodStub`] exposing `build` (named fields → request
//! message) and `call` (message + metadata → response message). The
//! request's descriptor must be identical to the method's request
//! descriptor; mismatches fail before any network traffic.

use crate::client::{self, CallOptions};
use crate::error::CallError;

use rpc_core::{Channel, Metadata, Runtime};
use rpc_proto::{MethodRecord, MethodTable, ProtoCodec};
use std::sync::Arc;
use std::time::Duration;

/// Stubs for every method of a parsed `.proto`, sharing one channel.
pub struct StubSet<C: ProtoCodec> {
    channel: Channel,
    codec: Arc<C>,
    table: MethodTable<C::Descriptor>,
    deadline: Duration,
}

impl<C: ProtoCodec> StubSet<C> {
    /// Build stubs for `table` against `target`. Channels are shared: two
    /// stub sets for the same target reuse one connection.
    pub fn new(
        runtime: &Runtime,
        target: &str,
        table: MethodTable<C::Descriptor>,
        codec: Arc<C>,
    ) -> StubSet<C> {
        StubSet {
            channel: Channel::insecure(runtime, target),
            codec,
            table,
            deadline: client::DEFAULT_DEADLINE,
        }
    }

    /// Override the per-call deadline for every stub in the set.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// The target these stubs dial.
    pub fn target(&self) -> &str {
        self.channel.target()
    }

    /// Simple names of the available methods, in declaration order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.table.iter().map(|r| r.simple_name.as_str())
    }

    /// The stub for a method, by simple name.
    pub fn method(&self, simple_name: &str) -> Option<MethodStub<'_, C>> {
        self.table.get(simple_name).map(|record| MethodStub {
            set: self,
            record,
        })
    }
}

/// A single method's `build`/`call` pair.
pub struct MethodStub<'a, C: ProtoCodec> {
    set: &'a StubSet<C>,
    record: &'a MethodRecord<C::Descriptor>,
}

impl<'a, C: ProtoCodec> MethodStub<'a, C> {
    /// The parsed record backing this stub.
    pub fn record(&self) -> &MethodRecord<C::Descriptor> {
        self.record
    }

    /// Construct a request message from named fields.
    pub fn build(&self, fields: &[(&str, C::Value)]) -> Result<C::Message, CallError> {
        Ok(self.set.codec.build(&self.record.request, fields)?)
    }

    /// Invoke the method. `message` must be of the method's request type;
    /// an empty OK response decodes to the default response instance.
    pub fn call(&self, message: &C::Message, metadata: Metadata) -> Result<C::Message, CallError> {
        let codec = &self.set.codec;
        let got = codec.descriptor(message);
        if got != self.record.request {
            return Err(CallError::WrongRequestType {
                method: self.record.simple_name.clone(),
                expected: format!("{:?}", self.record.request),
                got: format!("{:?}", got),
            });
        }

        let request_bytes = codec.encode(message)?;
        let options = CallOptions {
            metadata,
            deadline: self.set.deadline,
        };
        let response_bytes = client::unary_on(
            &self.set.channel,
            &self.record.full_path,
            &request_bytes,
            options,
        )?;

        if response_bytes.is_empty() {
            return Ok(codec.default_message(&self.record.response));
        }
        Ok(codec.decode(&self.record.response, &response_bytes)?)
    }
}
