//! The server dispatch table.
//!
//! Maps fully-qualified method paths to byte handlers. Typed handlers are
//! wrapped at registration so the codec work (decode request, encode
//! response, response-type check) lives here and the server loop only
//! ever moves bytes. The table is borrowed immutably by `run()`, which
//! freezes it for the duration of the loop.

use crate::error::{HandlerError, ServerError};

use bytes::Bytes;
use rpc_core::Metadata;
use rpc_proto::{MethodRecord, ProtoCodec};
use std::collections::HashMap;
use std::sync::Arc;

/// A wrapped handler: request bytes and request metadata in, response
/// bytes out.
pub type HandlerFn = Box<dyn Fn(&[u8], &Metadata) -> Result<Bytes, HandlerError>>;

/// Method path → handler.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, HandlerFn>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw byte handler under a full method path.
    pub fn insert_raw(
        &mut self,
        full_path: impl Into<String>,
        handler: HandlerFn,
    ) -> Result<(), ServerError> {
        let full_path = full_path.into();
        if !full_path.starts_with('/') {
            return Err(ServerError::Config(format!(
                "method path must start with '/': {}",
                full_path
            )));
        }
        if self.handlers.contains_key(&full_path) {
            return Err(ServerError::Config(format!(
                "duplicate handler for {}",
                full_path
            )));
        }
        tracing::debug!(path = %full_path, "handler registered");
        self.handlers.insert(full_path, handler);
        Ok(())
    }

    /// Register a typed handler for a parsed method. The wrapper decodes
    /// the request with the method's request descriptor, runs the
    /// handler, verifies the response is of the method's response type,
    /// and encodes it.
    pub fn register<C, F>(
        &mut self,
        record: &MethodRecord<C::Descriptor>,
        codec: Arc<C>,
        handler: F,
    ) -> Result<(), ServerError>
    where
        C: ProtoCodec + 'static,
        F: Fn(C::Message, &Metadata) -> Result<C::Message, HandlerError> + 'static,
    {
        let request_descriptor = record.request.clone();
        let response_descriptor = record.response.clone();
        let method = record.simple_name.clone();

        let wrapped: HandlerFn = Box::new(move |bytes, metadata| {
            let request = codec
                .decode(&request_descriptor, bytes)
                .map_err(|e| HandlerError(format!("cannot decode request for {}: {}", method, e)))?;
            let response = handler(request, metadata)?;
            if codec.descriptor(&response) != response_descriptor {
                return Err(HandlerError(format!(
                    "handler for {} returned a message of the wrong type",
                    method
                )));
            }
            codec
                .encode(&response)
                .map_err(|e| HandlerError(format!("cannot encode response for {}: {}", method, e)))
        });
        self.insert_raw(&record.full_path, wrapped)
    }

    /// Resolve a wire-level method path.
    pub fn lookup(&self, full_path: &str) -> Option<&HandlerFn> {
        self.handlers.get(full_path)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered paths, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_proto::{parse_source, DynamicCodec};

    fn echo_handler() -> HandlerFn {
        Box::new(|bytes, _| Ok(Bytes::copy_from_slice(bytes)))
    }

    #[test]
    fn raw_registration_and_lookup() {
        let mut table = DispatchTable::new();
        table.insert_raw("/svc.S/Echo", echo_handler()).unwrap();

        assert_eq!(table.len(), 1);
        let handler = table.lookup("/svc.S/Echo").unwrap();
        let out = handler(b"abc", &Metadata::new()).unwrap();
        assert_eq!(&out[..], b"abc");
        assert!(table.lookup("/svc.S/Other").is_none());
    }

    #[test]
    fn duplicate_path_rejected() {
        let mut table = DispatchTable::new();
        table.insert_raw("/svc.S/Echo", echo_handler()).unwrap();
        assert!(matches!(
            table.insert_raw("/svc.S/Echo", echo_handler()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn path_must_be_absolute() {
        let mut table = DispatchTable::new();
        assert!(matches!(
            table.insert_raw("svc.S/Echo", echo_handler()),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn typed_handler_roundtrips_messages() {
        let codec = Arc::new(DynamicCodec::new());
        let table = parse_source(
            r#"
            package hw;
            message HelloRequest { string name = 1; }
            message HelloReply { string message = 1; }
            service Greeter { rpc SayHello (HelloRequest) returns (HelloReply); }
            "#,
            codec.as_ref(),
        )
        .unwrap();
        let record = table.get("SayHello").unwrap();

        let mut dispatch = DispatchTable::new();
        {
            let codec = codec.clone();
            let reply_descriptor = record.response.clone();
            dispatch
                .register(record, codec.clone(), move |request, _metadata| {
                    let mut reply = codec.default_message(&reply_descriptor);
                    reply.set("message", format!("Hello, {}", request.get_str("name")))?;
                    Ok(reply)
                })
                .unwrap();
        }

        let request = codec
            .build(&record.request, &[("name", "World".into())])
            .unwrap();
        let request_bytes = codec.encode(&request).unwrap();

        let handler = dispatch.lookup("/hw.Greeter/SayHello").unwrap();
        let reply_bytes = handler(&request_bytes, &Metadata::new()).unwrap();
        let reply = codec.decode(&record.response, &reply_bytes).unwrap();
        assert_eq!(reply.get_str("message"), "Hello, World");
    }

    #[test]
    fn typed_handler_wrong_response_type_is_handler_error() {
        let codec = Arc::new(DynamicCodec::new());
        let table = parse_source(
            r#"
            message A { string x = 1; }
            message B { string y = 1; }
            service S { rpc Get (A) returns (B); }
            "#,
            codec.as_ref(),
        )
        .unwrap();
        let record = table.get("Get").unwrap();

        let mut dispatch = DispatchTable::new();
        {
            // Echo the request back even though the method returns B.
            let codec = codec.clone();
            dispatch
                .register(record, codec.clone(), move |request, _| Ok(request))
                .unwrap();
        }

        let request = codec.build(&record.request, &[("x", "v".into())]).unwrap();
        let bytes = codec.encode(&request).unwrap();
        let err = dispatch.lookup("/S/Get").unwrap()(&bytes, &Metadata::new()).unwrap_err();
        assert!(err.to_string().contains("wrong type"));
    }
}
