//! RQL-to-SQL translator
//!
//! Compiles a parsed [`RqlQuery`] into a parameterized `WHERE` clause plus
//! ordering and paging. Field paths are resolved hop by hop against a
//! query-mode [`Node`] tree: every relational hop becomes an
//! `EXISTS (SELECT 1 FROM ...)` wrapping the rest of the predicate.
//!
//! Literals are always bound positionally (`$1`, `$2`, ...); value functions
//! (`null()`, `empty()`, `true()`, `false()`) are emitted as constants.

use crate::error::{EngineError, Result, RqlError, RqlErrorCode};
use crate::links::GENERIC_OBJECT_KEY;
use crate::meta::{FieldDescription, FieldType, LinkType, MetaStore};
use crate::node::Node;
use crate::rql_ast::{RqlArg, RqlNode, RqlQuery};
use crate::types::Value;

/// Output of the translator
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlQuery {
    pub where_clause: String,
    pub binds: Vec<Value>,
    /// Comma separated order terms, the key tiebreaker included
    pub order: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SqlQuery {
    /// Render a full `SELECT` over `table` aliased as `alias`
    pub fn to_sql(&self, table: &str, alias: &str, columns: &[String]) -> String {
        let columns = if columns.is_empty() {
            format!("{}.*", alias)
        } else {
            columns
                .iter()
                .map(|c| format!("{}.\"{}\"", alias, c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {} {}", columns, table, alias);
        if !self.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clause);
        }
        if !self.order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order);
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        sql
    }
}

/// Alias of the root table of a query
pub fn root_alias(meta_name: &str) -> String {
    meta_name.chars().next().map(String::from).unwrap_or_else(|| "t".to_string())
}

/// Constant produced by a value function
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Bind(Value),
    Null,
    Constant(&'static str),
}

pub struct SqlTranslator<'a> {
    metas: &'a dyn MetaStore,
    table_prefix: &'a str,
}

struct Scope<'n> {
    node: &'n Node,
    alias: String,
}

impl<'a> SqlTranslator<'a> {
    pub fn new(metas: &'a dyn MetaStore, table_prefix: &'a str) -> Self {
        SqlTranslator { metas, table_prefix }
    }

    pub fn translate(&self, query: &RqlQuery, root: &Node) -> Result<SqlQuery> {
        let meta = root
            .meta
            .as_ref()
            .ok_or_else(|| rql_err(RqlErrorCode::Internal, "Root node has no meta"))?;
        let scope = Scope {
            node: root,
            alias: root_alias(&meta.name),
        };
        let mut binds = Vec::new();
        let where_clause = match &query.node {
            Some(node) => self.expression(node, &scope, &mut binds)?,
            None => String::new(),
        };

        let mut order = Vec::new();
        let mut key_sorted = false;
        for term in &query.sort {
            let field = meta.find_field(&term.by).ok_or_else(|| {
                rql_err(
                    RqlErrorCode::WrongFieldName,
                    format!("Sort field '{}' not found in '{}'", term.by, meta.name),
                )
            })?;
            if !field.is_table_column() {
                return Err(rql_err(
                    RqlErrorCode::WrongFieldName,
                    format!("Field '{}' cannot be used for sorting", term.by),
                ));
            }
            key_sorted |= field.name == meta.key;
            let direction = if term.desc { " DESC" } else { "" };
            order.push(format!("{}.\"{}\"{}", scope.alias, field.name, direction));
        }
        if !key_sorted {
            order.push(format!("{}.\"{}\"", scope.alias, meta.key));
        }

        Ok(SqlQuery {
            where_clause,
            binds,
            order: order.join(","),
            limit: query.limit,
            offset: query.offset,
        })
    }

    fn expression(&self, node: &RqlNode, scope: &Scope, binds: &mut Vec<Value>) -> Result<String> {
        match node.op.to_lowercase().as_str() {
            op @ ("and" | "or") => {
                if node.args.is_empty() {
                    return Err(rql_err(RqlErrorCode::Wrong, format!("'{}' requires arguments", op)));
                }
                let mut parts = Vec::with_capacity(node.args.len());
                for arg in &node.args {
                    parts.push(self.expression(expect_node(arg, op)?, scope, binds)?);
                }
                let glue = if op == "and" { " AND " } else { " OR " };
                Ok(format!("({})", parts.join(glue)))
            }
            "not" => {
                if node.args.len() != 1 {
                    return Err(rql_err(RqlErrorCode::Wrong, "'not' requires exactly one argument"));
                }
                let inner = self.expression(expect_node(&node.args[0], "not")?, scope, binds)?;
                Ok(format!("NOT ({})", inner))
            }
            op @ ("eq" | "ne" | "lt" | "le" | "gt" | "ge" | "like" | "in" | "is_null") => {
                if node.args.len() != 2 {
                    return Err(rql_err(
                        RqlErrorCode::Wrong,
                        format!("'{}' requires a field and a value", op),
                    ));
                }
                let path = node.args[0].as_value().ok_or_else(|| {
                    rql_err(RqlErrorCode::WrongFieldName, format!("First argument of '{}' must be a field", op))
                })?;
                let segments: Vec<&str> = path.split('.').collect();
                let value = &node.args[1];
                self.field_expression(scope, &segments, &mut |alias: &str, column: &str, field: &FieldDescription, binds: &mut Vec<Value>| {
                    self.predicate(op, alias, column, field, value, binds)
                }, binds)
            }
            other => Err(rql_err(
                RqlErrorCode::UnknownOperator,
                format!("RQL operator '{}' is unknown", other),
            )),
        }
    }

    /// Resolve `path` from `scope`, calling `terminal` for the final column
    fn field_expression(
        &self,
        scope: &Scope,
        path: &[&str],
        terminal: &mut dyn FnMut(&str, &str, &FieldDescription, &mut Vec<Value>) -> Result<String>,
        binds: &mut Vec<Value>,
    ) -> Result<String> {
        let meta = scope
            .node
            .meta
            .as_ref()
            .ok_or_else(|| rql_err(RqlErrorCode::Internal, "Node without meta"))?;
        let name = path[0];
        let field = meta.find_field(name).ok_or_else(|| {
            rql_err(
                RqlErrorCode::WrongFieldName,
                format!("Field '{}' not found in '{}'", name, meta.name),
            )
        })?;
        let rest = &path[1..];

        if rest.is_empty() {
            return match (field.field_type, field.link_type) {
                (FieldType::Generic, LinkType::Inner) => {
                    terminal(&scope.alias, &format!("{}__type", field.name), field, binds)
                }
                (FieldType::Array | FieldType::Objects, _) | (FieldType::Generic, LinkType::Outer) => Err(rql_err(
                    RqlErrorCode::WrongFieldName,
                    format!("Field '{}' of '{}' is a relation and cannot be compared", name, meta.name),
                )),
                _ => terminal(&scope.alias, &field.name, field, binds),
            };
        }

        match (field.field_type, field.link_type) {
            (FieldType::Objects, _) => {
                let through_name = field.link_through.as_deref().unwrap_or_default();
                let through = self.metas.require_meta(through_name)?;
                let reverse = through
                    .find_field(&meta.name)
                    .and_then(|f| f.reverse_outer_field(meta))
                    .ok_or_else(|| {
                        rql_err(
                            RqlErrorCode::Internal,
                            format!("Reverse field of '{}' not found in '{}'", through_name, meta.name),
                        )
                    })?;
                let target = field.link_meta.as_deref().unwrap_or_default();
                let mut rewritten: Vec<&str> = vec![reverse.name.as_str(), target];
                rewritten.extend_from_slice(rest);
                self.field_expression(scope, &rewritten, terminal, binds)
            }
            (FieldType::Generic, LinkType::Inner) => {
                let object = rest[0];
                if object == GENERIC_OBJECT_KEY && rest.len() == 1 {
                    return terminal(&scope.alias, &format!("{}__type", field.name), field, binds);
                }
                let generic = self.child_node(scope, name)?;
                let child = generic.instantiate_generic(object, self.metas).map_err(|_| {
                    rql_err(
                        RqlErrorCode::WrongFieldName,
                        format!("Object '{}' is not a target of generic field '{}'", object, name),
                    )
                })?;
                if rest.len() < 2 {
                    return Err(rql_err(
                        RqlErrorCode::WrongFieldName,
                        format!("Path '{}' must name a field of '{}'", path.join("."), object),
                    ));
                }
                let target = child
                    .meta
                    .as_ref()
                    .ok_or_else(|| rql_err(RqlErrorCode::Internal, "Generic node without meta"))?;
                let alias = child_alias(&scope.alias, name);
                let join = format!(
                    "{}.\"{}\"::text={}.\"{}__key\"",
                    alias, target.key, scope.alias, field.name
                );
                binds.push(Value::String(object.to_string()));
                let discriminator = binds.len();
                let inner_scope = Scope { node: &child, alias: alias.clone() };
                let inner = self.field_expression(&inner_scope, &rest[1..], terminal, binds)?;
                Ok(format!(
                    "{}.\"{}__type\"=${} AND EXISTS (SELECT 1 FROM {}{} {} WHERE {} AND {})",
                    scope.alias, field.name, discriminator, self.table_prefix, target.name, alias, join, inner
                ))
            }
            (FieldType::Object, LinkType::Inner)
            | (FieldType::Array, LinkType::Outer)
            | (FieldType::Generic, LinkType::Outer) => {
                let child = self.child_node(scope, name)?;
                let target = child
                    .meta
                    .as_ref()
                    .ok_or_else(|| rql_err(RqlErrorCode::Internal, "Relation node without meta"))?;
                let alias = child_alias(&scope.alias, name);
                let join = match (field.field_type, field.link_type) {
                    (FieldType::Object, _) => {
                        format!("{}.\"{}\"={}.\"{}\"", alias, target.key, scope.alias, field.name)
                    }
                    (FieldType::Array, _) => {
                        let outer = field.outer_link_field.as_deref().unwrap_or_default();
                        format!("{}.\"{}\"={}.\"{}\"", alias, outer, scope.alias, meta.key)
                    }
                    _ => {
                        let outer = field.outer_link_field.as_deref().unwrap_or_default();
                        binds.push(Value::String(meta.name.clone()));
                        format!(
                            "{}.\"{}__key\"={}.\"{}\"::text AND {}.\"{}__type\"=${}",
                            alias, outer, scope.alias, meta.key, alias, outer, binds.len()
                        )
                    }
                };
                let inner_scope = Scope { node: &child, alias: alias.clone() };
                let inner = self.field_expression(&inner_scope, rest, terminal, binds)?;
                Ok(format!(
                    "EXISTS (SELECT 1 FROM {}{} {} WHERE {} AND {})",
                    self.table_prefix, target.name, alias, join, inner
                ))
            }
            _ => Err(rql_err(
                RqlErrorCode::WrongFieldName,
                format!("Field '{}' of '{}' is not a relation", name, meta.name),
            )),
        }
    }

    fn child_node(&self, scope: &Scope, name: &str) -> Result<Node> {
        scope.node.child(name, self.metas)?.ok_or_else(|| {
            rql_err(
                RqlErrorCode::WrongFieldName,
                format!("Field '{}' cannot be traversed", name),
            )
        })
    }

    fn predicate(
        &self,
        op: &str,
        alias: &str,
        column: &str,
        field: &FieldDescription,
        value: &RqlArg,
        binds: &mut Vec<Value>,
    ) -> Result<String> {
        let column = format!("{}.\"{}\"", alias, column);
        match op {
            "is_null" => {
                let flag = match value {
                    RqlArg::Value(v) => v.parse::<bool>().ok(),
                    RqlArg::Node(n) if n.args.is_empty() => match n.op.as_str() {
                        "true" => Some(true),
                        "false" => Some(false),
                        _ => None,
                    },
                    _ => None,
                };
                match flag {
                    Some(true) => Ok(format!("{} IS NULL", column)),
                    Some(false) => Ok(format!("{} IS NOT NULL", column)),
                    None => Err(rql_err(
                        RqlErrorCode::Wrong,
                        format!("Second argument of 'is_null' must be a boolean, got '{}'", value),
                    )),
                }
            }
            "in" => {
                let items: Vec<&RqlArg> = match value {
                    RqlArg::List(items) => items.iter().collect(),
                    single => vec![single],
                };
                if items.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    placeholders.push(self.placeholder(field, item, binds)?);
                }
                Ok(format!("{} IN ({})", column, placeholders.join(",")))
            }
            "like" => {
                let raw = value.as_value().ok_or_else(|| {
                    rql_err(RqlErrorCode::WrongValue, format!("'like' expects a pattern, got '{}'", value))
                })?;
                binds.push(Value::String(glob_to_like(raw)));
                Ok(format!("{} ILIKE ${}", column, binds.len()))
            }
            _ => {
                let sql_op = match op {
                    "eq" => "=",
                    "ne" => "!=",
                    "lt" => "<",
                    "le" => "<=",
                    "gt" => ">",
                    _ => ">=",
                };
                let operand = self.placeholder(field, value, binds)?;
                Ok(format!("{} {}{}", column, sql_op, operand))
            }
        }
    }

    /// Bind a literal (or inline a value function), returning its SQL form
    fn placeholder(&self, field: &FieldDescription, value: &RqlArg, binds: &mut Vec<Value>) -> Result<String> {
        match operand(field, value)? {
            Operand::Bind(v) => {
                binds.push(v);
                Ok(format!("${}", binds.len()))
            }
            Operand::Constant(c) => Ok(c.to_string()),
            Operand::Null => Err(rql_err(
                RqlErrorCode::WrongValue,
                format!("Field '{}' cannot be compared with NULL, use is_null", field.name),
            )),
        }
    }
}

fn operand(field: &FieldDescription, value: &RqlArg) -> Result<Operand> {
    let value_type = field.value_type();
    match value {
        RqlArg::Value(raw) => field.value_from_str(raw).map(Operand::Bind).ok_or_else(|| {
            rql_err(
                RqlErrorCode::WrongValue,
                format!("Value '{}' is not a valid {} for field '{}'", raw, value_type, field.name),
            )
        }),
        RqlArg::Node(function) => {
            let string_like = matches!(
                value_type,
                FieldType::String | FieldType::Enum | FieldType::Date | FieldType::DateTime | FieldType::Time
            );
            let checked = |ok: bool, operand: Operand| {
                if ok {
                    Ok(operand)
                } else {
                    Err(rql_err(
                        RqlErrorCode::WrongValue,
                        format!("Value function '{}' does not fit field '{}'", function.op, field.name),
                    ))
                }
            };
            match function.op.to_lowercase().as_str() {
                "null" => Ok(Operand::Null),
                "empty" => checked(string_like, Operand::Constant("''")),
                "true" => checked(value_type == FieldType::Bool, Operand::Constant("TRUE")),
                "false" => checked(value_type == FieldType::Bool, Operand::Constant("FALSE")),
                other => Err(rql_err(
                    RqlErrorCode::UnknownValueFunction,
                    format!("Value function '{}' is unknown", other),
                )),
            }
        }
        RqlArg::List(_) => Err(rql_err(
            RqlErrorCode::WrongValue,
            format!("A list is not a valid value for field '{}'", field.name),
        )),
    }
}

/// Value of a literal argument for `field`, value functions resolved; used by
/// evaluators that interpret the AST directly
pub fn literal_value(field: &FieldDescription, value: &RqlArg) -> Result<Option<Value>> {
    match operand(field, value)? {
        Operand::Bind(v) => Ok(Some(v)),
        Operand::Null => Ok(None),
        Operand::Constant("TRUE") => Ok(Some(Value::Bool(true))),
        Operand::Constant("FALSE") => Ok(Some(Value::Bool(false))),
        Operand::Constant(_) => Ok(Some(Value::String(String::new()))),
    }
}

/// Rewrite leading/trailing `*` globs to SQL `%`
pub fn glob_to_like(pattern: &str) -> String {
    let mut result = pattern.to_string();
    if result.starts_with('*') {
        result.replace_range(..1, "%");
    }
    if result.len() > 1 && result.ends_with('*') {
        let end = result.len() - 1;
        result.replace_range(end.., "%");
    }
    result
}

fn child_alias(parent: &str, field: &str) -> String {
    format!("{}{}", parent, field.chars().next().unwrap_or('x'))
}

fn expect_node<'r>(arg: &'r RqlArg, op: &str) -> Result<&'r RqlNode> {
    match arg {
        RqlArg::Node(node) => Ok(node),
        other => Err(rql_err(
            RqlErrorCode::Wrong,
            format!("Arguments of '{}' must be expressions, got '{}'", op, other),
        )),
    }
}

fn rql_err(code: RqlErrorCode, message: impl Into<String>) -> EngineError {
    EngineError::Rql(RqlError::new(code, message))
}
