//! Named connections between output and input terminals.

use std::marker::PhantomData;

use tracing::debug;

use keyflow_data::{Key, Value};
use keyflow_errors::KeyflowResult;

use crate::terminal::{In, Out};

/// A named wire from one output terminal to one or more input terminals.
///
/// Connections are realized eagerly: `connect` immediately records the input
/// in the output's successor list. Terminals outlive any edge, so the edge
/// itself holds nothing but its name. Wiring is rejected once the producing
/// operator has been made executable.
pub struct Edge<K: Key, V: Value> {
    name: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: Key, V: Value> Edge<K, V> {
    /// A new edge named for graph diagnostics.
    pub fn new(name: impl Into<String>) -> Self {
        Edge {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    /// Bind `out` to `input`. May be called repeatedly to fan out.
    pub fn connect(&self, out: &Out<K, V>, input: &In<K, V>) -> KeyflowResult<()> {
        debug!(edge = %self.name, "connecting terminals");
        out.connect_input(input)
    }

    /// The edge's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
