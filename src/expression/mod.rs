// Copyright (c) 2024-present, grist-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Typed result values and the executable expression tree used by the
//! grouping engine.

mod node;
mod result_node;

pub use node::{
    AddNode, AggregationRefNode, AttributeNode, AttributeSource, ConstantNode, DocIdNode,
    ExecutionInput, ExpressionNode, ExpressionNodeOps, ExpressionTree, ModuloNode, MulNode,
    RankNode,
};
pub use result_node::{ResultNode, ResultNodeVector};
