//! A self-contained dynamic message codec.
//!
//! `DynamicCodec` is the bundled [`ProtoCodec`] implementation for hosts
//! that do not bring a Protocol Buffer runtime of their own. It compiles
//! `message` blocks with scalar fields into a descriptor pool and moves
//! [`DynamicMessage`] values through the protobuf wire format. Descriptor
//! identity is pointer identity within the pool, which stays stable when
//! the same file is compiled again.

use crate::codec::{CodecError, ProtoCodec};
use crate::token::{tokenize, Cursor};
use crate::wire;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Scalar field kinds the codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Bytes,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Bool,
}

impl FieldKind {
    fn from_proto_type(name: &str) -> Option<FieldKind> {
        Some(match name {
            "string" => FieldKind::String,
            "bytes" => FieldKind::Bytes,
            "int32" => FieldKind::Int32,
            "int64" => FieldKind::Int64,
            "uint32" => FieldKind::Uint32,
            "uint64" => FieldKind::Uint64,
            "bool" => FieldKind::Bool,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Bytes => "bytes",
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::Uint32 => "uint32",
            FieldKind::Uint64 => "uint64",
            FieldKind::Bool => "bool",
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bytes(Vec<u8>),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Bool(bool),
}

impl Value {
    fn kind_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::I32(_) => "int32",
            Value::I64(_) => "int64",
            Value::U32(_) => "uint32",
            Value::U64(_) => "uint64",
            Value::Bool(_) => "bool",
        }
    }

    fn matches(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Value::Str(_), FieldKind::String)
                | (Value::Bytes(_), FieldKind::Bytes)
                | (Value::I32(_), FieldKind::Int32)
                | (Value::I64(_), FieldKind::Int64)
                | (Value::U32(_), FieldKind::Uint32)
                | (Value::U64(_), FieldKind::Uint64)
                | (Value::Bool(_), FieldKind::Bool)
        )
    }

    /// The string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload widened to i64, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            Value::U32(v) => Some(i64::from(*v)),
            Value::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

#[derive(Debug)]
struct FieldDef {
    name: String,
    number: u32,
    kind: FieldKind,
}

#[derive(Debug)]
struct MessageType {
    fq_name: String,
    fields: Vec<FieldDef>,
}

/// Opaque handle to a registered message type.
///
/// Equality is identity: two descriptors compare equal exactly when they
/// refer to the same pool registration.
#[derive(Clone)]
pub struct MessageDescriptor {
    inner: Arc<MessageType>,
}

impl MessageDescriptor {
    /// Fully-qualified type name.
    pub fn full_name(&self) -> &str {
        &self.inner.fq_name
    }

    fn field_by_name(&self, name: &str) -> Option<&FieldDef> {
        self.inner.fields.iter().find(|f| f.name == name)
    }

    fn field_by_number(&self, number: u32) -> Option<&FieldDef> {
        self.inner.fields.iter().find(|f| f.number == number)
    }
}

impl PartialEq for MessageDescriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MessageDescriptor {}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageDescriptor({})", self.inner.fq_name)
    }
}

/// A message value carrying its descriptor and set fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicMessage {
    descriptor: MessageDescriptor,
    fields: BTreeMap<u32, Value>,
}

impl DynamicMessage {
    /// The message's descriptor.
    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// Get a field by name. Unset fields return `None`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let field = self.descriptor.field_by_name(name)?;
        self.fields.get(&field.number)
    }

    /// Convenience accessor for string fields, yielding `""` when unset,
    /// matching protobuf default semantics.
    pub fn get_str(&self, name: &str) -> &str {
        self.get(name).and_then(Value::as_str).unwrap_or("")
    }

    /// Set a field by name, checking the value kind.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CodecError> {
        let value = value.into();
        let field = self.descriptor.field_by_name(name).ok_or_else(|| {
            CodecError::UnknownField {
                message: self.descriptor.full_name().to_string(),
                field: name.to_string(),
            }
        })?;
        if !value.matches(field.kind) {
            return Err(CodecError::TypeMismatch {
                field: field.name.clone(),
                expected: field.kind.name(),
                got: value.kind_name(),
            });
        }
        self.fields.insert(field.number, value);
        Ok(())
    }
}

/// Descriptor pool plus wire codec. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct DynamicCodec {
    pool: Mutex<HashMap<String, MessageDescriptor>>,
}

impl DynamicCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile_message(&self, cursor: &mut Cursor, package: &str) -> Result<(), CodecError> {
        let name = cursor
            .next()
            .ok_or_else(|| CodecError::Malformed("expected message name".into()))?;
        if !cursor.eat("{") {
            return Err(CodecError::Malformed(format!(
                "expected '{{' after message {}",
                name.text
            )));
        }

        let mut fields: Vec<FieldDef> = Vec::new();
        loop {
            let token = cursor.next().ok_or_else(|| {
                CodecError::Malformed(format!("unterminated message {}", name.text))
            })?;
            match token.text.as_str() {
                "}" => break,
                "message" | "enum" | "oneof" | "map" => {
                    return Err(CodecError::Unsupported(format!(
                        "{} inside message {} (line {})",
                        token.text, name.text, token.line
                    )));
                }
                "repeated" | "optional" | "required" => {
                    return Err(CodecError::Unsupported(format!(
                        "field label {} (line {})",
                        token.text, token.line
                    )));
                }
                "reserved" | "option" => {
                    while let Some(t) = cursor.next() {
                        if t.text == ";" {
                            break;
                        }
                    }
                }
                kind_text => {
                    let kind = FieldKind::from_proto_type(kind_text).ok_or_else(|| {
                        CodecError::Unsupported(format!(
                            "field type {} (line {})",
                            kind_text, token.line
                        ))
                    })?;
                    let field_name = cursor.next().ok_or_else(|| {
                        CodecError::Malformed("expected field name".into())
                    })?;
                    if !cursor.eat("=") {
                        return Err(CodecError::Malformed(format!(
                            "expected '=' after field {} (line {})",
                            field_name.text, field_name.line
                        )));
                    }
                    let number_token = cursor.next().ok_or_else(|| {
                        CodecError::Malformed("expected field number".into())
                    })?;
                    let number: u32 = number_token.text.parse().map_err(|_| {
                        CodecError::Malformed(format!(
                            "bad field number {} (line {})",
                            number_token.text, number_token.line
                        ))
                    })?;
                    if !cursor.eat(";") {
                        return Err(CodecError::Malformed(format!(
                            "expected ';' after field {} (line {})",
                            field_name.text, field_name.line
                        )));
                    }
                    if fields.iter().any(|f| f.number == number) {
                        return Err(CodecError::Malformed(format!(
                            "duplicate field number {} in message {}",
                            number, name.text
                        )));
                    }
                    fields.push(FieldDef {
                        name: field_name.text,
                        number,
                        kind,
                    });
                }
            }
        }

        let fq_name = if package.is_empty() {
            name.text.clone()
        } else {
            format!("{}.{}", package, name.text)
        };
        let mut pool = self.pool.lock();
        // Re-compiles keep the original registration so descriptor
        // identity stays stable.
        pool.entry(fq_name.clone()).or_insert_with(|| {
            tracing::debug!(message = %fq_name, fields = fields.len(), "registered message type");
            MessageDescriptor {
                inner: Arc::new(MessageType { fq_name, fields }),
            }
        });
        Ok(())
    }
}

impl ProtoCodec for DynamicCodec {
    type Descriptor = MessageDescriptor;
    type Message = DynamicMessage;
    type Value = Value;

    fn compile(&self, source: &str) -> Result<(), CodecError> {
        let mut cursor = Cursor::new(tokenize(source));
        let mut package = String::new();
        while let Some(token) = cursor.next() {
            match token.text.as_str() {
                "syntax" | "option" | "import" => {
                    while let Some(t) = cursor.next() {
                        if t.text == ";" {
                            break;
                        }
                    }
                }
                "package" => {
                    package = cursor
                        .next()
                        .ok_or_else(|| CodecError::Malformed("expected package name".into()))?
                        .text;
                    cursor.eat(";");
                }
                "message" => self.compile_message(&mut cursor, &package)?,
                "service" => {
                    cursor.next();
                    if !cursor.skip_block() {
                        return Err(CodecError::Malformed("unterminated service block".into()));
                    }
                }
                "enum" => {
                    return Err(CodecError::Unsupported(format!(
                        "top-level enum (line {})",
                        token.line
                    )));
                }
                other => {
                    return Err(CodecError::Malformed(format!(
                        "unexpected token {} (line {})",
                        other, token.line
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<MessageDescriptor> {
        self.pool.lock().get(name).cloned()
    }

    fn descriptor(&self, message: &DynamicMessage) -> MessageDescriptor {
        message.descriptor.clone()
    }

    fn build(
        &self,
        descriptor: &MessageDescriptor,
        fields: &[(&str, Value)],
    ) -> Result<DynamicMessage, CodecError> {
        let mut message = self.default_message(descriptor);
        for (name, value) in fields {
            message.set(name, value.clone())?;
        }
        Ok(message)
    }

    fn encode(&self, message: &DynamicMessage) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        for (number, value) in &message.fields {
            match value {
                Value::Str(s) => wire::put_len_delimited(*number, s.as_bytes(), &mut buf),
                Value::Bytes(b) => wire::put_len_delimited(*number, b, &mut buf),
                Value::I32(v) => wire::put_varint_field(*number, wire::int_to_varint(i64::from(*v)), &mut buf),
                Value::I64(v) => wire::put_varint_field(*number, wire::int_to_varint(*v), &mut buf),
                Value::U32(v) => wire::put_varint_field(*number, u64::from(*v), &mut buf),
                Value::U64(v) => wire::put_varint_field(*number, *v, &mut buf),
                Value::Bool(v) => wire::put_varint_field(*number, u64::from(*v), &mut buf),
            }
        }
        Ok(Bytes::from(buf))
    }

    fn decode(&self, descriptor: &MessageDescriptor, bytes: &[u8]) -> Result<DynamicMessage, CodecError> {
        let mut message = self.default_message(descriptor);
        let mut buf = bytes;
        let malformed = |reason: &str| CodecError::Decode {
            message: descriptor.full_name().to_string(),
            reason: reason.to_string(),
        };
        while !buf.is_empty() {
            let (number, wire_type) =
                wire::get_tag(&mut buf).ok_or_else(|| malformed("truncated tag"))?;
            match descriptor.field_by_number(number) {
                Some(field) => {
                    let value = match field.kind {
                        FieldKind::String => {
                            let data = wire::get_len_delimited(&mut buf)
                                .ok_or_else(|| malformed("truncated string field"))?;
                            let text = std::str::from_utf8(data)
                                .map_err(|_| malformed("string field is not utf-8"))?;
                            Value::Str(text.to_string())
                        }
                        FieldKind::Bytes => {
                            let data = wire::get_len_delimited(&mut buf)
                                .ok_or_else(|| malformed("truncated bytes field"))?;
                            Value::Bytes(data.to_vec())
                        }
                        FieldKind::Int32 => {
                            let raw = wire::get_varint(&mut buf)
                                .ok_or_else(|| malformed("truncated varint"))?;
                            Value::I32(wire::varint_to_int(raw) as i32)
                        }
                        FieldKind::Int64 => {
                            let raw = wire::get_varint(&mut buf)
                                .ok_or_else(|| malformed("truncated varint"))?;
                            Value::I64(wire::varint_to_int(raw))
                        }
                        FieldKind::Uint32 => {
                            let raw = wire::get_varint(&mut buf)
                                .ok_or_else(|| malformed("truncated varint"))?;
                            Value::U32(raw as u32)
                        }
                        FieldKind::Uint64 => {
                            let raw = wire::get_varint(&mut buf)
                                .ok_or_else(|| malformed("truncated varint"))?;
                            Value::U64(raw)
                        }
                        FieldKind::Bool => {
                            let raw = wire::get_varint(&mut buf)
                                .ok_or_else(|| malformed("truncated varint"))?;
                            Value::Bool(raw != 0)
                        }
                    };
                    message.fields.insert(number, value);
                }
                None => {
                    wire::skip_field(wire_type, &mut buf)
                        .ok_or_else(|| malformed("malformed unknown field"))?;
                }
            }
        }
        Ok(message)
    }

    fn default_message(&self, descriptor: &MessageDescriptor) -> DynamicMessage {
        DynamicMessage {
            descriptor: descriptor.clone(),
            fields: BTreeMap::new(),
        }
    }
}
