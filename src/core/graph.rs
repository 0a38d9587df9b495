use crate::core::error::TraceError;
use crate::core::shape::{format_dims, DType, Dim};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type ValueId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub id: ValueId,
    pub dtype: DType,
    pub dims: Vec<Dim>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: String,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weights: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub value: ValueId,
}

/// Static computation captured from one forward pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub values: Vec<ValueInfo>,
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn value(&self, id: ValueId) -> Option<&ValueInfo> {
        self.values.get(id)
    }

    pub fn input(&self, name: &str) -> Option<&ValueInfo> {
        self.inputs
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| self.value(p.value))
    }

    pub fn output(&self, name: &str) -> Option<&ValueInfo> {
        self.outputs
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| self.value(p.value))
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|p| p.name.as_str()).collect()
    }

    /// Weight prefixes consumed by the graph, deduplicated and sorted.
    pub fn weight_prefixes(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.weights.iter().map(|w| w.as_str()))
            .collect()
    }

    pub fn ops(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.op.as_str()).collect()
    }
}

/// Handle to a value inside a trace. Carries shape and dtype, never data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traced {
    id: ValueId,
    dtype: DType,
    dims: Vec<Dim>,
}

impl Traced {
    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, axis: usize) -> &Dim {
        &self.dims[axis]
    }

    pub fn expect_rank(&self, op: &str, rank: usize) -> Result<(), TraceError> {
        if self.rank() != rank {
            return Err(TraceError::InvalidOperand {
                op: op.to_string(),
                reason: format!(
                    "expected rank {} but got {}",
                    rank,
                    format_dims(&self.dims)
                ),
            });
        }
        Ok(())
    }
}

/// Named values bound to a wrapper's declared inputs.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: Vec<(String, Traced)>,
}

impl Bindings {
    pub fn insert(&mut self, name: impl Into<String>, value: Traced) {
        self.values.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Result<&Traced, TraceError> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| TraceError::UnknownInput(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub struct TraceScope {
    graph: Graph,
}

impl TraceScope {
    pub(crate) fn new() -> Self {
        Self {
            graph: Graph::default(),
        }
    }

    pub(crate) fn placeholder(&mut self, name: &str, dtype: DType, dims: Vec<Dim>) -> Traced {
        let value = self.new_value(dtype, dims);
        self.graph.inputs.push(Port {
            name: name.to_string(),
            value: value.id,
        });
        value
    }

    pub fn op<'a>(&'a mut self, op: &str, inputs: &[&Traced]) -> OpBuilder<'a> {
        OpBuilder {
            scope: self,
            op: op.to_string(),
            inputs: inputs.iter().map(|t| t.id).collect(),
            attrs: BTreeMap::new(),
            weights: Vec::new(),
        }
    }

    /// Reading a concrete value is what a data-dependent loop needs to decide
    /// whether to continue. A static graph has no values to read, so this
    /// always fails.
    pub fn read_value(&self, value: &Traced, op: &str) -> Result<f32, TraceError> {
        Err(TraceError::DataDependentControlFlow {
            op: op.to_string(),
            reason: format!(
                "control flow depends on the runtime value of %{} {}",
                value.id,
                format_dims(&value.dims)
            ),
        })
    }

    pub fn node_count(&self) -> usize {
        self.graph.nodes.len()
    }

    pub(crate) fn finish(mut self, outputs: Vec<(String, Traced)>) -> Graph {
        self.graph.outputs = outputs
            .into_iter()
            .map(|(name, value)| Port {
                name,
                value: value.id,
            })
            .collect();
        self.graph
    }

    fn new_value(&mut self, dtype: DType, dims: Vec<Dim>) -> Traced {
        let id = self.graph.values.len();
        self.graph.values.push(ValueInfo {
            id,
            dtype,
            dims: dims.clone(),
        });
        Traced { id, dtype, dims }
    }
}

pub struct OpBuilder<'a> {
    scope: &'a mut TraceScope,
    op: String,
    inputs: Vec<ValueId>,
    attrs: BTreeMap<String, serde_json::Value>,
    weights: Vec<String>,
}

impl<'a> OpBuilder<'a> {
    pub fn attr(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn weights(mut self, prefix: impl Into<String>) -> Self {
        self.weights.push(prefix.into());
        self
    }

    pub fn output(self, dtype: DType, dims: Vec<Dim>) -> Traced {
        let (scope, mut node) = self.into_node();
        let value = scope.new_value(dtype, dims);
        node.outputs.push(value.id);
        scope.graph.nodes.push(node);
        value
    }

    pub fn outputs(self, specs: Vec<(DType, Vec<Dim>)>) -> Vec<Traced> {
        let (scope, mut node) = self.into_node();
        let outputs: Vec<Traced> = specs
            .into_iter()
            .map(|(dtype, dims)| scope.new_value(dtype, dims))
            .collect();
        node.outputs = outputs.iter().map(|t| t.id).collect();
        scope.graph.nodes.push(node);
        outputs
    }

    fn into_node(self) -> (&'a mut TraceScope, Node) {
        let node = Node {
            op: self.op,
            inputs: self.inputs,
            outputs: Vec::new(),
            attrs: self.attrs,
            weights: self.weights,
        };
        (self.scope, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_records_nodes() {
        let mut scope = TraceScope::new();
        let ids = scope.placeholder(
            "input_ids",
            DType::Int64,
            vec![Dim::Fixed(1), Dim::symbol("input_ids:1", 10, 1, 2048)],
        );

        let hidden = scope
            .op("embedding", &[&ids])
            .weights("model.embed_tokens.")
            .attr("hidden_size", 64)
            .output(
                DType::Float32,
                vec![ids.dim(0).clone(), ids.dim(1).clone(), Dim::Fixed(64)],
            );

        assert_eq!(scope.node_count(), 1);
        let graph = scope.finish(vec![("hidden".to_string(), hidden)]);

        assert_eq!(graph.input_names(), vec!["input_ids"]);
        assert_eq!(graph.output_names(), vec!["hidden"]);
        assert_eq!(graph.ops(), vec!["embedding"]);
        assert_eq!(graph.nodes[0].inputs, vec![0]);
        assert_eq!(graph.nodes[0].attrs["hidden_size"], 64);

        let out = graph.output("hidden").unwrap();
        assert_eq!(out.dims[1].bounds(), (1, 2048));
        assert_eq!(out.dims[2], Dim::Fixed(64));
        assert!(graph.weight_prefixes().contains("model.embed_tokens."));
    }

    #[test]
    fn test_read_value_is_data_dependent() {
        let mut scope = TraceScope::new();
        let stop = scope.placeholder("stop", DType::Float32, vec![Dim::Fixed(1)]);
        let err = scope.read_value(&stop, "generate").unwrap_err();
        assert!(matches!(err, TraceError::DataDependentControlFlow { .. }));
    }

    #[test]
    fn test_bindings_lookup() {
        let mut scope = TraceScope::new();
        let audio = scope.placeholder("audio", DType::Float32, vec![Dim::Fixed(1)]);
        let mut bindings = Bindings::default();
        bindings.insert("audio", audio);

        assert!(bindings.get("audio").is_ok());
        assert_eq!(
            bindings.get("input_ids").unwrap_err(),
            TraceError::UnknownInput("input_ids".to_string())
        );
    }
}
