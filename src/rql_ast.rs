//! RQL Abstract Syntax Tree

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator call such as `eq(name,x)` or `and(...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RqlNode {
    pub op: String,
    pub args: Vec<RqlArg>,
}

impl RqlNode {
    pub fn new(op: impl Into<String>, args: Vec<RqlArg>) -> Self {
        RqlNode { op: op.into(), args }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RqlArg {
    Node(RqlNode),
    /// Literal or field path, unparsed
    Value(String),
    /// Parenthesized value list `(a,b)`
    List(Vec<RqlArg>),
}

impl RqlArg {
    pub fn as_value(&self) -> Option<&str> {
        match self {
            RqlArg::Value(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortTerm {
    pub by: String,
    pub desc: bool,
}

/// Parsed query: filter tree plus side-channel modifiers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RqlQuery {
    pub node: Option<RqlNode>,
    pub sort: Vec<SortTerm>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl fmt::Display for RqlArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RqlArg::Node(node) => write!(f, "{}", node),
            RqlArg::Value(v) => write!(f, "{}", v),
            RqlArg::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for RqlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.op)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}
