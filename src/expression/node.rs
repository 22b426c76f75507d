// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{decode_string, encode_string, Decode, DecodeError, Encode, EncodeError};
use crate::expression::ResultNode;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use std::io::{Read, Write};

const CLASS_CONSTANT: u32 = 64;
const CLASS_DOC_ID: u32 = 65;
const CLASS_RANK: u32 = 66;
const CLASS_ATTRIBUTE: u32 = 67;
const CLASS_ADD: u32 = 68;
const CLASS_MUL: u32 = 69;
const CLASS_MODULO: u32 = 70;
const CLASS_AGGREGATION_REF: u32 = 71;

/// Environment seam for attribute-backed values.
pub trait AttributeSource {
    /// Value of `attribute` for a document, if present.
    fn value(&self, attribute: &str, doc_id: u32) -> Option<ResultNode>;

    /// Resolves an enum id of `attribute` into its string form.
    fn enum_string(&self, attribute: &str, enum_id: u64) -> Option<String>;
}

/// One execution context: a doc id plus its rank, optionally a document id
/// string (streaming visits) and an attribute source.
#[derive(Clone, Copy)]
pub struct ExecutionInput<'a> {
    pub doc_id: u32,
    pub rank: f64,
    pub document_id: Option<&'a str>,
    pub attributes: Option<&'a dyn AttributeSource>,
}

impl<'a> ExecutionInput<'a> {
    #[must_use]
    pub fn new(doc_id: u32, rank: f64) -> Self {
        Self {
            doc_id,
            rank,
            document_id: None,
            attributes: None,
        }
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: &'a dyn AttributeSource) -> Self {
        self.attributes = Some(attributes);
        self
    }

    #[must_use]
    pub fn with_document_id(mut self, document_id: &'a str) -> Self {
        self.document_id = Some(document_id);
        self
    }
}

/// Capability set of every expression node.
#[enum_dispatch]
pub trait ExpressionNodeOps {
    /// Called once before aggregation starts.
    fn prepare(&mut self, preserve_accurate_types: bool);

    /// Computes the node value for the given input.
    fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()>;

    /// The value produced by the last `execute`.
    fn result(&self) -> &ResultNode;

    /// Re-points aggregation references at the given rank values.
    fn bind_aggregation_refs(&mut self, ranks: &[ResultNode]);
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstantNode {
    value: ResultNode,
}

impl ConstantNode {
    #[must_use]
    pub fn new(value: ResultNode) -> Self {
        Self { value }
    }
}

impl ExpressionNodeOps for ConstantNode {
    fn prepare(&mut self, _preserve_accurate_types: bool) {}

    fn execute(&mut self, _input: &ExecutionInput<'_>) -> crate::Result<()> {
        Ok(())
    }

    fn result(&self) -> &ResultNode {
        &self.value
    }

    fn bind_aggregation_refs(&mut self, _ranks: &[ResultNode]) {}
}

/// Yields the doc id of the current input.
#[derive(Clone, Debug, Default)]
pub struct DocIdNode {
    result: ResultNode,
}

// Node equality is structural; cached results do not participate.
impl PartialEq for DocIdNode {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl ExpressionNodeOps for DocIdNode {
    fn prepare(&mut self, _preserve_accurate_types: bool) {
        self.result = ResultNode::Integer(0);
    }

    fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        self.result = ResultNode::Integer(i64::from(input.doc_id));
        Ok(())
    }

    fn result(&self) -> &ResultNode {
        &self.result
    }

    fn bind_aggregation_refs(&mut self, _ranks: &[ResultNode]) {}
}

/// Yields the rank of the current input.
#[derive(Clone, Debug, Default)]
pub struct RankNode {
    result: ResultNode,
}

impl PartialEq for RankNode {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl ExpressionNodeOps for RankNode {
    fn prepare(&mut self, _preserve_accurate_types: bool) {
        self.result = ResultNode::Float(0.0);
    }

    fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        self.result = ResultNode::Float(input.rank);
        Ok(())
    }

    fn result(&self) -> &ResultNode {
        &self.result
    }

    fn bind_aggregation_refs(&mut self, _ranks: &[ResultNode]) {}
}

/// Looks up a named attribute for the current doc id.
#[derive(Clone, Debug)]
pub struct AttributeNode {
    name: String,
    result: ResultNode,
}

impl PartialEq for AttributeNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl AttributeNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: ResultNode::Integer(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExpressionNodeOps for AttributeNode {
    fn prepare(&mut self, _preserve_accurate_types: bool) {}

    fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        if let Some(attributes) = input.attributes {
            if let Some(value) = attributes.value(&self.name, input.doc_id) {
                self.result = value;
            }
        }
        Ok(())
    }

    fn result(&self) -> &ResultNode {
        &self.result
    }

    fn bind_aggregation_refs(&mut self, _ranks: &[ResultNode]) {}
}

macro_rules! binary_node {
    ($name:ident, $apply:expr) => {
        #[derive(Clone, Debug)]
        pub struct $name {
            lhs: Box<ExpressionNode>,
            rhs: Box<ExpressionNode>,
            result: ResultNode,
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.lhs == other.lhs && self.rhs == other.rhs
            }
        }

        impl $name {
            #[must_use]
            pub fn new(lhs: ExpressionNode, rhs: ExpressionNode) -> Self {
                Self {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    result: ResultNode::Integer(0),
                }
            }
        }

        impl ExpressionNodeOps for $name {
            fn prepare(&mut self, preserve_accurate_types: bool) {
                self.lhs.prepare(preserve_accurate_types);
                self.rhs.prepare(preserve_accurate_types);
            }

            fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
                self.lhs.execute(input)?;
                self.rhs.execute(input)?;
                let apply: fn(&ResultNode, &ResultNode) -> ResultNode = $apply;
                self.result = apply(self.lhs.result(), self.rhs.result());
                Ok(())
            }

            fn result(&self) -> &ResultNode {
                &self.result
            }

            fn bind_aggregation_refs(&mut self, ranks: &[ResultNode]) {
                self.lhs.bind_aggregation_refs(ranks);
                self.rhs.bind_aggregation_refs(ranks);
            }
        }
    };
}

binary_node!(AddNode, |a, b| {
    if a.is_integer_kind() && b.is_integer_kind() {
        ResultNode::Integer(a.as_integer().wrapping_add(b.as_integer()))
    } else {
        ResultNode::Float(a.as_float() + b.as_float())
    }
});

binary_node!(MulNode, |a, b| {
    if a.is_integer_kind() && b.is_integer_kind() {
        ResultNode::Integer(a.as_integer().wrapping_mul(b.as_integer()))
    } else {
        ResultNode::Float(a.as_float() * b.as_float())
    }
});

binary_node!(ModuloNode, |a, b| {
    if a.is_integer_kind() && b.is_integer_kind() {
        let rhs = b.as_integer();
        ResultNode::Integer(if rhs == 0 { 0 } else { a.as_integer() % rhs })
    } else {
        let rhs = b.as_float();
        ResultNode::Float(if rhs == 0.0 { 0.0 } else { a.as_float() % rhs })
    }
});

/// Reference into the owning group's aggregation-result array, used by
/// order-by expressions. The referenced rank value is bound before the
/// expression executes.
#[derive(Clone, Debug)]
pub struct AggregationRefNode {
    index: u32,
    result: ResultNode,
}

impl PartialEq for AggregationRefNode {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl AggregationRefNode {
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            result: ResultNode::Integer(0),
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl ExpressionNodeOps for AggregationRefNode {
    fn prepare(&mut self, _preserve_accurate_types: bool) {}

    fn execute(&mut self, _input: &ExecutionInput<'_>) -> crate::Result<()> {
        Ok(())
    }

    fn result(&self) -> &ResultNode {
        &self.result
    }

    fn bind_aggregation_refs(&mut self, ranks: &[ResultNode]) {
        if let Some(rank) = ranks.get(self.index as usize) {
            self.result = rank.clone();
        }
    }
}

/// One node of an executable expression tree.
#[enum_dispatch(ExpressionNodeOps)]
#[derive(Clone, Debug, PartialEq)]
pub enum ExpressionNode {
    Constant(ConstantNode),
    DocId(DocIdNode),
    Rank(RankNode),
    Attribute(AttributeNode),
    Add(AddNode),
    Mul(MulNode),
    Modulo(ModuloNode),
    AggregationRef(AggregationRefNode),
}

impl ExpressionNode {
    #[must_use]
    pub fn class_id(&self) -> u32 {
        match self {
            Self::Constant(_) => CLASS_CONSTANT,
            Self::DocId(_) => CLASS_DOC_ID,
            Self::Rank(_) => CLASS_RANK,
            Self::Attribute(_) => CLASS_ATTRIBUTE,
            Self::Add(_) => CLASS_ADD,
            Self::Mul(_) => CLASS_MUL,
            Self::Modulo(_) => CLASS_MODULO,
            Self::AggregationRef(_) => CLASS_AGGREGATION_REF,
        }
    }

    /// The attribute name backing this node, if it is attribute-based.
    #[must_use]
    pub fn attribute_name(&self) -> Option<&str> {
        match self {
            Self::Attribute(node) => Some(node.name()),
            _ => None,
        }
    }
}

impl Encode for ExpressionNode {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.class_id())?;
        match self {
            Self::Constant(node) => node.value.encode_into(writer)?,
            Self::DocId(_) | Self::Rank(_) => {}
            Self::Attribute(node) => encode_string(writer, &node.name)?,
            Self::Add(node) => {
                node.lhs.encode_into(writer)?;
                node.rhs.encode_into(writer)?;
            }
            Self::Mul(node) => {
                node.lhs.encode_into(writer)?;
                node.rhs.encode_into(writer)?;
            }
            Self::Modulo(node) => {
                node.lhs.encode_into(writer)?;
                node.rhs.encode_into(writer)?;
            }
            Self::AggregationRef(node) => writer.write_u32::<BigEndian>(node.index)?,
        }
        Ok(())
    }
}

impl Decode for ExpressionNode {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let class_id = reader.read_u32::<BigEndian>()?;

        Ok(match class_id {
            CLASS_CONSTANT => Self::Constant(ConstantNode::new(ResultNode::decode_from(reader)?)),
            CLASS_DOC_ID => Self::DocId(DocIdNode::default()),
            CLASS_RANK => Self::Rank(RankNode::default()),
            CLASS_ATTRIBUTE => Self::Attribute(AttributeNode::new(decode_string(reader)?)),
            CLASS_ADD => {
                let lhs = Self::decode_from(reader)?;
                let rhs = Self::decode_from(reader)?;
                Self::Add(AddNode::new(lhs, rhs))
            }
            CLASS_MUL => {
                let lhs = Self::decode_from(reader)?;
                let rhs = Self::decode_from(reader)?;
                Self::Mul(MulNode::new(lhs, rhs))
            }
            CLASS_MODULO => {
                let lhs = Self::decode_from(reader)?;
                let rhs = Self::decode_from(reader)?;
                Self::Modulo(ModuloNode::new(lhs, rhs))
            }
            CLASS_AGGREGATION_REF => {
                Self::AggregationRef(AggregationRefNode::new(reader.read_u32::<BigEndian>()?))
            }
            tag => return Err(DecodeError::InvalidTag(("ExpressionNode", tag))),
        })
    }
}

/// A single-rooted expression DAG with a cached result.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionTree {
    root: ExpressionNode,
}

impl Default for ExpressionTree {
    fn default() -> Self {
        Self {
            root: ExpressionNode::Constant(ConstantNode::new(ResultNode::Integer(0))),
        }
    }
}

impl ExpressionTree {
    #[must_use]
    pub fn new(root: ExpressionNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &ExpressionNode {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut ExpressionNode {
        &mut self.root
    }

    pub fn prepare(&mut self, preserve_accurate_types: bool) {
        self.root.prepare(preserve_accurate_types);
    }

    pub fn execute(&mut self, input: &ExecutionInput<'_>) -> crate::Result<()> {
        self.root.execute(input)
    }

    pub fn result(&self) -> &ResultNode {
        self.root.result()
    }
}

impl Encode for ExpressionTree {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        self.root.encode_into(writer)
    }
}

impl Decode for ExpressionTree {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            root: ExpressionNode::decode_from(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn doc_id_modulo_classifier() -> crate::Result<()> {
        let mut tree = ExpressionTree::new(ExpressionNode::Modulo(ModuloNode::new(
            ExpressionNode::DocId(DocIdNode::default()),
            ExpressionNode::Constant(ConstantNode::new(ResultNode::Integer(2))),
        )));

        tree.execute(&ExecutionInput::new(5, 0.0))?;
        assert_eq!(&ResultNode::Integer(1), tree.result());

        tree.execute(&ExecutionInput::new(4, 0.0))?;
        assert_eq!(&ResultNode::Integer(0), tree.result());

        Ok(())
    }

    #[test]
    fn tree_serde_roundtrip() -> Result<(), crate::coding::DecodeError> {
        let tree = ExpressionTree::new(ExpressionNode::Add(AddNode::new(
            ExpressionNode::Attribute(AttributeNode::new("year")),
            ExpressionNode::Constant(ConstantNode::new(ResultNode::Integer(7))),
        )));

        let bytes = tree.encode_into_vec();
        let decoded = ExpressionTree::decode_from(&mut &bytes[..])?;
        assert_eq!(tree, decoded);

        Ok(())
    }
}
