//! Parameter trees
//!
//! An ordered, named hierarchy of tensors. Model weights, gradients and
//! optimizer moments all share this representation so that leaf-wise
//! operations can check structure before touching any values.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::sharding::Placement;

/// Tensor class of a leaf; drives the placement rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    Embedding,
    LinearWeight,
    NormScale,
    Bias,
    Other,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub kind: ParamKind,
    pub value: Tensor,
    pub placement: Option<Placement>,
}

impl Param {
    pub fn new(kind: ParamKind, value: Tensor) -> Self {
        Self {
            kind,
            value,
            placement: None,
        }
    }

    /// Same leaf with a new value. Placement is dropped: any mutation has
    /// to go back through the sharding manager.
    pub fn with_value(&self, value: Tensor) -> Self {
        Self {
            kind: self.kind,
            value,
            placement: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.value.dims()
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(Param),
    Branch(Vec<(String, Node)>),
}

impl Node {
    pub fn leaf(kind: ParamKind, value: Tensor) -> Self {
        Node::Leaf(Param::new(kind, value))
    }

    pub fn branch(children: Vec<(String, Node)>) -> Self {
        Node::Branch(children)
    }
}

/// One leaf of a [`TreeDef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafDef {
    pub path: String,
    pub kind: ParamKind,
    pub shape: Vec<usize>,
}

/// Structure of a tree: ordered leaf paths, kinds and shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDef {
    pub leaves: Vec<LeafDef>,
}

impl TreeDef {
    /// Describe the first difference between two structures, if any.
    pub fn diff(&self, other: &TreeDef) -> Option<String> {
        if self.leaves.len() != other.leaves.len() {
            return Some(format!(
                "expected {} leaves, found {}",
                self.leaves.len(),
                other.leaves.len()
            ));
        }
        self.leaves
            .iter()
            .zip(other.leaves.iter())
            .find(|(a, b)| a != b)
            .map(|(a, b)| {
                format!(
                    "leaf `{}` {:?}{:?} does not match `{}` {:?}{:?}",
                    a.path, a.kind, a.shape, b.path, b.kind, b.shape
                )
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamTree {
    children: Vec<(String, Node)>,
}

impl ParamTree {
    /// Build a tree, rejecting empty names, names containing `.` and
    /// duplicate siblings so that leaf paths are unambiguous.
    pub fn new(children: Vec<(String, Node)>) -> Result<Self> {
        validate_names("", &children)?;
        Ok(Self { children })
    }

    pub fn children(&self) -> &[(String, Node)] {
        &self.children
    }

    /// Leaves in depth-first order with their dotted paths.
    pub fn leaves(&self) -> Vec<(String, &Param)> {
        let mut out = Vec::new();
        collect_leaves("", &self.children, &mut out);
        out
    }

    pub fn paths(&self) -> Vec<String> {
        self.leaves().into_iter().map(|(path, _)| path).collect()
    }

    pub fn values(&self) -> Vec<Tensor> {
        self.leaves().into_iter().map(|(_, p)| p.value.clone()).collect()
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves().len()
    }

    pub fn num_elements(&self) -> usize {
        self.leaves()
            .iter()
            .map(|(_, p)| p.value.elem_count())
            .sum()
    }

    /// Bytes held by the leaf values as they are stored.
    pub fn num_bytes(&self) -> usize {
        self.leaves()
            .iter()
            .map(|(_, p)| p.value.elem_count() * p.value.dtype().size_in_bytes())
            .sum()
    }

    pub fn get(&self, path: &str) -> Result<&Param> {
        let mut nodes = &self.children;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let node = nodes
                .iter()
                .find(|(name, _)| name == part)
                .map(|(_, node)| node)
                .ok_or_else(|| MeshError::MissingParameter(path.to_string()))?;
            match (node, parts.peek().is_some()) {
                (Node::Leaf(param), false) => return Ok(param),
                (Node::Branch(children), true) => nodes = children,
                _ => break,
            }
        }
        Err(MeshError::MissingParameter(path.to_string()))
    }

    /// Tensor at `path`.
    pub fn tensor(&self, path: &str) -> Result<&Tensor> {
        self.get(path).map(|p| &p.value)
    }

    pub fn structure(&self) -> TreeDef {
        TreeDef {
            leaves: self
                .leaves()
                .into_iter()
                .map(|(path, p)| LeafDef {
                    path,
                    kind: p.kind,
                    shape: p.shape().to_vec(),
                })
                .collect(),
        }
    }

    pub fn ensure_same_structure(&self, other: &ParamTree) -> Result<()> {
        match self.structure().diff(&other.structure()) {
            Some(msg) => Err(MeshError::StructureMismatch(msg)),
            None => Ok(()),
        }
    }

    /// Rebuild every leaf, keeping names and nesting.
    pub fn map<F>(&self, mut f: F) -> Result<ParamTree>
    where
        F: FnMut(&str, &Param) -> Result<Param>,
    {
        Ok(ParamTree {
            children: map_nodes("", &self.children, &mut f)?,
        })
    }

    /// Leaf-wise combination of two trees of identical structure.
    pub fn zip_map<F>(&self, other: &ParamTree, mut f: F) -> Result<ParamTree>
    where
        F: FnMut(&str, &Param, &Param) -> Result<Param>,
    {
        self.ensure_same_structure(other)?;
        Ok(ParamTree {
            children: zip_nodes("", &self.children, &other.children, &mut f)?,
        })
    }

    pub fn map_values<F>(&self, mut f: F) -> Result<ParamTree>
    where
        F: FnMut(&Tensor) -> candle_core::Result<Tensor>,
    {
        self.map(|_, p| Ok(p.with_value(f(&p.value)?)))
    }

    pub fn zeros_like(&self) -> Result<ParamTree> {
        self.map_values(|t| t.zeros_like())
    }

    /// Attach a flat leaf sequence to this tree's structure. Only values
    /// change; a count or shape mismatch is a `StructureMismatch`.
    pub fn with_values(&self, values: Vec<Tensor>) -> Result<ParamTree> {
        let expected = self.num_leaves();
        if values.len() != expected {
            return Err(MeshError::StructureMismatch(format!(
                "expected {} leaves, found {}",
                expected,
                values.len()
            )));
        }
        let mut values = values.into_iter();
        self.map(|path, p| {
            // Length checked above.
            let value = values
                .next()
                .ok_or_else(|| MeshError::StructureMismatch(path.to_string()))?;
            if value.dims() != p.shape() {
                return Err(MeshError::StructureMismatch(format!(
                    "leaf `{}` has shape {:?}, stored value has {:?}",
                    path,
                    p.shape(),
                    value.dims()
                )));
            }
            Ok(p.with_value(value))
        })
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn validate_names(prefix: &str, nodes: &[(String, Node)]) -> Result<()> {
    for (i, (name, node)) in nodes.iter().enumerate() {
        if name.is_empty() || name.contains('.') {
            return Err(MeshError::Config(format!(
                "invalid parameter name `{}` under `{}`",
                name, prefix
            )));
        }
        if nodes[..i].iter().any(|(other, _)| other == name) {
            return Err(MeshError::Config(format!(
                "duplicate parameter name `{}`",
                join(prefix, name)
            )));
        }
        if let Node::Branch(children) = node {
            validate_names(&join(prefix, name), children)?;
        }
    }
    Ok(())
}

fn collect_leaves<'a>(prefix: &str, nodes: &'a [(String, Node)], out: &mut Vec<(String, &'a Param)>) {
    for (name, node) in nodes {
        let path = join(prefix, name);
        match node {
            Node::Leaf(param) => out.push((path, param)),
            Node::Branch(children) => collect_leaves(&path, children, out),
        }
    }
}

fn map_nodes<F>(prefix: &str, nodes: &[(String, Node)], f: &mut F) -> Result<Vec<(String, Node)>>
where
    F: FnMut(&str, &Param) -> Result<Param>,
{
    let mut out = Vec::with_capacity(nodes.len());
    for (name, node) in nodes {
        let path = join(prefix, name);
        let mapped = match node {
            Node::Leaf(param) => Node::Leaf(f(&path, param)?),
            Node::Branch(children) => Node::Branch(map_nodes(&path, children, f)?),
        };
        out.push((name.clone(), mapped));
    }
    Ok(out)
}

fn zip_nodes<F>(
    prefix: &str,
    lhs: &[(String, Node)],
    rhs: &[(String, Node)],
    f: &mut F,
) -> Result<Vec<(String, Node)>>
where
    F: FnMut(&str, &Param, &Param) -> Result<Param>,
{
    let mut out = Vec::with_capacity(lhs.len());
    for ((name, a), (_, b)) in lhs.iter().zip(rhs.iter()) {
        let path = join(prefix, name);
        let combined = match (a, b) {
            (Node::Leaf(pa), Node::Leaf(pb)) => Node::Leaf(f(&path, pa, pb)?),
            (Node::Branch(ca), Node::Branch(cb)) => Node::Branch(zip_nodes(&path, ca, cb, f)?),
            _ => return Err(MeshError::StructureMismatch(format!("node `{}`", path))),
        };
        out.push((name.clone(), combined));
    }
    Ok(out)
}
