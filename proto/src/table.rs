//! Method tables built from service definitions.

use crate::error::ProtoError;
use std::collections::HashMap;

/// One unary RPC as declared in a service block.
#[derive(Debug, Clone)]
pub struct MethodRecord<D> {
    /// The rpc name as host code types it.
    pub simple_name: String,
    /// Wire-level path: `/<pkg>.<Service>/<Rpc>`, or `/<Service>/<Rpc>`
    /// without a package.
    pub full_path: String,
    /// Request message descriptor.
    pub request: D,
    /// Response message descriptor.
    pub response: D,
    /// `stream` before the request type. Surfaced but never dispatched.
    pub client_streaming: bool,
    /// `stream` before the response type. Surfaced but never dispatched.
    pub server_streaming: bool,
}

/// All RPCs of a `.proto` file, keyed by simple name with a secondary
/// index by full path. Immutable once parsing completes.
#[derive(Debug, Clone)]
pub struct MethodTable<D> {
    records: Vec<MethodRecord<D>>,
    by_name: HashMap<String, usize>,
    by_path: HashMap<String, usize>,
}

impl<D> Default for MethodTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> MethodTable<D> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            by_name: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    /// Add a record. Simple names must be unique across all services in
    /// the file, so host code can address methods unambiguously.
    pub(crate) fn insert(&mut self, record: MethodRecord<D>) -> Result<(), ProtoError> {
        if self.by_name.contains_key(&record.simple_name) {
            return Err(ProtoError::parse_in_rpc(
                "duplicate rpc name across services",
                record.simple_name.clone(),
            ));
        }
        if self.by_path.contains_key(&record.full_path) {
            return Err(ProtoError::parse_in_rpc(
                format!("duplicate method path {}", record.full_path),
                record.simple_name.clone(),
            ));
        }
        let index = self.records.len();
        self.by_name.insert(record.simple_name.clone(), index);
        self.by_path.insert(record.full_path.clone(), index);
        self.records.push(record);
        Ok(())
    }

    /// Look up by simple rpc name.
    pub fn get(&self, simple_name: &str) -> Option<&MethodRecord<D>> {
        self.by_name.get(simple_name).map(|&i| &self.records[i])
    }

    /// Look up by wire-level method path.
    pub fn get_by_path(&self, full_path: &str) -> Option<&MethodRecord<D>> {
        self.by_path.get(full_path).map(|&i| &self.records[i])
    }

    /// Records in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &MethodRecord<D>> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
