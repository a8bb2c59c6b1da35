//! rpc-host - embed unary gRPC clients and servers in a scripting host.
//!
//! The embedding has two halves. On the client side, a [`StubSet`] binds a
//! parsed method table to a channel and exposes per-method `build`/`call`
//! stubs with strict request-type checking. On the server side,
//! [`server::run`] drives the accept/read/dispatch/respond loop against a
//! [`DispatchTable`] of byte handlers, reporting lifecycle boundaries
//! through [`ServerHooks`] and honoring a cooperative interrupt and an
//! optional wall-clock duration.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod server;
pub mod signal;
pub mod stub;

pub use client::{unary, unary_on, CallOptions, DEFAULT_DEADLINE};
pub use config::{ConfigError, LogFormat, LoggingConfig, ServerConfig};
pub use dispatch::{DispatchTable, HandlerFn};
pub use error::{CallError, HandlerError, ServerError};
pub use hooks::{NoopHooks, ServerHooks};
pub use server::{run, serve_probe, RunOptions};
pub use stub::{MethodStub, StubSet};

// The pieces hosts touch directly when composing the layers themselves.
pub use rpc_core::{Code, Metadata, Runtime, Status};
pub use rpc_proto::{parse_file, parse_source, DynamicCodec, MethodTable, ProtoCodec};
