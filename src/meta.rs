//! Schema/link model
//!
//! Object types ("metas") are described at runtime by [`MetaDescription`]s and
//! compiled by the [`MetaRegistry`] into [`Meta`]s: many-to-many through objects
//! are synthesized, reverse outer fields are added and every outer link is
//! checked against its target. The rest of the engine reads metas through the
//! narrow [`MetaStore`] interface.

use crate::error::{EngineError, Result};
use crate::notification::{Notifier, TestNotifier};
use crate::types::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Scalar or relational kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Bool,
    DateTime,
    Date,
    Time,
    Enum,
    /// Single object link
    Object,
    /// Array of objects, reverse side of an inner object link
    Array,
    /// Many-to-many link through a synthesized object
    Objects,
    /// Polymorphic link
    Generic,
}

impl FieldType {
    /// Check that a payload value has the JSON shape this type expects
    pub fn assert_type(&self, value: &Value) -> bool {
        match self {
            FieldType::String | FieldType::DateTime | FieldType::Date | FieldType::Time | FieldType::Enum => {
                matches!(value, Value::String(_))
            }
            FieldType::Number => value.is_number(),
            FieldType::Bool => matches!(value, Value::Bool(_)),
            FieldType::Object | FieldType::Generic => matches!(value, Value::Map(_)),
            FieldType::Array | FieldType::Objects => matches!(value, Value::List(_)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::DateTime => "datetime",
            FieldType::Date => "date",
            FieldType::Time => "time",
            FieldType::Enum => "enum",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Objects => "objects",
            FieldType::Generic => "generic",
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            FieldType::Object | FieldType::Array | FieldType::Objects | FieldType::Generic
        )
    }

    /// Parse a textual value (filter argument, URL key) into this type
    pub fn value_from_str(&self, raw: &str) -> Option<Value> {
        match self {
            FieldType::Number => raw
                .parse::<i64>()
                .map(Value::Int)
                .ok()
                .or_else(|| raw.parse::<f64>().ok().map(Value::Float)),
            FieldType::Bool => raw.parse::<bool>().ok().map(Value::Bool),
            FieldType::Object | FieldType::Array | FieldType::Objects => None,
            _ => Some(Value::String(raw.to_string())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a relational field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    None,
    Inner,
    Outer,
}

impl Default for LinkType {
    fn default() -> Self {
        LinkType::None
    }
}

/// Policy applied to dependents when the record they reference is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnDeleteStrategy {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
}

impl OnDeleteStrategy {
    pub fn from_verbose(name: &str) -> Option<Self> {
        match name {
            "" | "cascade" => Some(OnDeleteStrategy::Cascade),
            "restrict" => Some(OnDeleteStrategy::Restrict),
            "setNull" => Some(OnDeleteStrategy::SetNull),
            "setDefault" => Some(OnDeleteStrategy::SetDefault),
            _ => None,
        }
    }

    pub fn verbose(&self) -> &'static str {
        match self {
            OnDeleteStrategy::Cascade => "cascade",
            OnDeleteStrategy::Restrict => "restrict",
            OnDeleteStrategy::SetNull => "setNull",
            OnDeleteStrategy::SetDefault => "setDefault",
        }
    }
}

/// Mutating operation an action is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Create,
    Update,
    Remove,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Update => "update",
            Method::Remove => "remove",
        }
    }
}

/// Notification delivery protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "TEST")]
    Test,
}

/// Whether a graph is being built to fetch records or to compile a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    Retrieve,
    Query,
}

/// Declared field default
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Sequence-backed number (`{"func": "nextval"}`)
    NextVal,
    Literal(Value),
}

impl DefaultValue {
    fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) => match map.get("func").and_then(|f| f.as_str()) {
                Some("nextval") => Some(DefaultValue::NextVal),
                _ => map.get("value").map(|v| DefaultValue::Literal(Value::from(v.clone()))),
            },
            other => Some(DefaultValue::Literal(Value::from(other.clone()))),
        }
    }
}

/// Declarative description of one field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub link_type: LinkType,
    #[serde(default)]
    pub link_meta: Option<String>,
    #[serde(default)]
    pub link_meta_list: Vec<String>,
    #[serde(default)]
    pub outer_link_field: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub on_delete: String,
    #[serde(default)]
    pub retrieve_mode: bool,
    #[serde(default)]
    pub query_mode: bool,
    #[serde(default)]
    pub now_on_create: bool,
    #[serde(default)]
    pub now_on_update: bool,
    #[serde(default, alias = "def")]
    pub default: serde_json::Value,
    #[serde(default, rename = "enum")]
    pub choices: Vec<String>,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.to_string(),
            field_type,
            link_type: LinkType::None,
            link_meta: None,
            link_meta_list: Vec::new(),
            outer_link_field: None,
            optional: false,
            on_delete: String::new(),
            retrieve_mode: false,
            query_mode: false,
            now_on_create: false,
            now_on_update: false,
            default: serde_json::Value::Null,
            choices: Vec::new(),
        }
    }

    /// Sequence-backed optional number key
    pub fn key(name: &str) -> Self {
        FieldSpec::new(name, FieldType::Number).optional().nextval()
    }

    pub fn object(name: &str, link_meta: &str) -> Self {
        let mut spec = FieldSpec::new(name, FieldType::Object);
        spec.link_type = LinkType::Inner;
        spec.link_meta = Some(link_meta.to_string());
        spec
    }

    pub fn array(name: &str, link_meta: &str, outer_link_field: &str) -> Self {
        let mut spec = FieldSpec::new(name, FieldType::Array);
        spec.link_type = LinkType::Outer;
        spec.link_meta = Some(link_meta.to_string());
        spec.outer_link_field = Some(outer_link_field.to_string());
        spec.optional = true;
        spec.retrieve_mode = true;
        spec.query_mode = true;
        spec
    }

    pub fn objects(name: &str, link_meta: &str) -> Self {
        let mut spec = FieldSpec::new(name, FieldType::Objects);
        spec.link_type = LinkType::Inner;
        spec.link_meta = Some(link_meta.to_string());
        spec.optional = true;
        spec.retrieve_mode = true;
        spec.query_mode = true;
        spec
    }

    pub fn generic(name: &str, link_meta_list: &[&str]) -> Self {
        let mut spec = FieldSpec::new(name, FieldType::Generic);
        spec.link_type = LinkType::Inner;
        spec.link_meta_list = link_meta_list.iter().map(|s| s.to_string()).collect();
        spec
    }

    pub fn generic_outer(name: &str, link_meta: &str, outer_link_field: &str) -> Self {
        let mut spec = FieldSpec::new(name, FieldType::Generic);
        spec.link_type = LinkType::Outer;
        spec.link_meta = Some(link_meta.to_string());
        spec.outer_link_field = Some(outer_link_field.to_string());
        spec.optional = true;
        spec.retrieve_mode = true;
        spec.query_mode = true;
        spec
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn nextval(mut self) -> Self {
        self.default = serde_json::json!({"func": "nextval"});
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = default;
        self
    }

    pub fn on_delete(mut self, strategy: &str) -> Self {
        self.on_delete = strategy.to_string();
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn retrieve_mode(mut self, enabled: bool) -> Self {
        self.retrieve_mode = enabled;
        self
    }

    pub fn now_on_create(mut self) -> Self {
        self.now_on_create = true;
        self
    }

    pub fn now_on_update(mut self) -> Self {
        self.now_on_update = true;
        self
    }
}

/// Declarative notification action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub method: Method,
    pub protocol: Protocol,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub active_if_not_root: bool,
    #[serde(default)]
    pub include_values: BTreeMap<String, serde_json::Value>,
}

impl ActionSpec {
    pub fn new(method: Method, protocol: Protocol) -> Self {
        ActionSpec {
            method,
            protocol,
            args: Vec::new(),
            active_if_not_root: false,
            include_values: BTreeMap::new(),
        }
    }

    pub fn include(mut self, alias: &str, getter: serde_json::Value) -> Self {
        self.include_values.insert(alias.to_string(), getter);
        self
    }
}

/// Declarative description of an object type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaDescription {
    pub name: String,
    pub key: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

impl MetaDescription {
    pub fn new(name: &str, key: &str) -> Self {
        MetaDescription {
            name: name.to_string(),
            key: key.to_string(),
            fields: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| EngineError::meta("", format!("Invalid meta description: {}", e)))
    }
}

/// Compiled field of a [`Meta`]
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    /// Owner meta name
    pub meta: String,
    pub field_type: FieldType,
    pub link_type: LinkType,
    pub link_meta: Option<String>,
    pub link_meta_list: Vec<String>,
    /// Through meta of a many-to-many field
    pub link_through: Option<String>,
    /// Inner field on `link_meta` this outer field mirrors
    pub outer_link_field: Option<String>,
    /// Key type of `link_meta` for object links
    pub link_key_type: Option<FieldType>,
    pub optional: bool,
    pub on_delete: Option<OnDeleteStrategy>,
    pub retrieve_mode: bool,
    pub query_mode: bool,
    pub now_on_create: bool,
    pub now_on_update: bool,
    pub default: Option<DefaultValue>,
    pub choices: Vec<String>,
}

impl FieldDescription {
    pub fn is_inner(&self) -> bool {
        self.link_type == LinkType::Inner
    }

    pub fn is_outer(&self) -> bool {
        self.link_type == LinkType::Outer
    }

    pub fn is_generic_inner(&self) -> bool {
        self.field_type == FieldType::Generic && self.is_inner()
    }

    pub fn is_generic_outer(&self) -> bool {
        self.field_type == FieldType::Generic && self.is_outer()
    }

    /// Whether the field is backed by a column of the owner's table
    pub fn is_table_column(&self) -> bool {
        !(self.is_outer() || self.field_type == FieldType::Objects)
    }

    /// Effective on-delete strategy, cascade unless declared otherwise
    pub fn on_delete_strategy(&self) -> OnDeleteStrategy {
        self.on_delete.unwrap_or(OnDeleteStrategy::Cascade)
    }

    /// Scalar type values of this field compare against
    pub fn value_type(&self) -> FieldType {
        match self.field_type {
            FieldType::Object => self.link_key_type.unwrap_or(FieldType::Number),
            FieldType::Generic => FieldType::String,
            other => other,
        }
    }

    pub fn value_from_str(&self, raw: &str) -> Option<Value> {
        self.value_type().value_from_str(raw)
    }

    /// Type check of an already typed value (value functions, keys)
    pub fn is_value_type_valid(&self, value: &Value) -> bool {
        self.value_type().assert_type(value)
    }

    /// The array field on `target` that mirrors this inner object field
    pub fn reverse_outer_field<'a>(&self, target: &'a Meta) -> Option<&'a FieldDescription> {
        if self.field_type != FieldType::Object || !self.is_inner() {
            return None;
        }
        target.fields.iter().find(|f| {
            f.field_type == FieldType::Array
                && f.is_outer()
                && f.outer_link_field.as_deref() == Some(self.name.as_str())
                && f.link_meta.as_deref() == Some(self.meta.as_str())
        })
    }

    /// Value written by the set-default removal strategy
    pub fn default_value(&self) -> Value {
        match &self.default {
            Some(DefaultValue::Literal(v)) => v.clone(),
            _ => Value::Null,
        }
    }
}

/// Reads a value for an action's notification payload
#[derive(Debug, Clone, PartialEq)]
pub enum Getter {
    /// Dotted field path, following inner links
    Path(String),
    /// Read through a generic field, choosing a path per concrete object
    Generic { field: String, cases: Vec<GetterCase> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetterCase {
    pub object: String,
    pub value: String,
}

impl Getter {
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::String(path) => Some(Getter::Path(path.clone())),
            serde_json::Value::Object(map) => {
                let field = map.get("field")?.as_str()?.to_string();
                let cases = map
                    .get("cases")
                    .and_then(|c| c.as_array())
                    .map(|cases| {
                        cases
                            .iter()
                            .filter_map(|case| {
                                Some(GetterCase {
                                    object: case.get("object")?.as_str()?.to_string(),
                                    value: case.get("value")?.as_str()?.to_string(),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Getter::Generic { field, cases })
            }
            _ => None,
        }
    }
}

/// Compiled notification action
#[derive(Debug, Clone)]
pub struct Action {
    /// Index of the action within its meta
    pub id: usize,
    pub method: Method,
    pub protocol: Protocol,
    pub args: Vec<String>,
    pub active_if_not_root: bool,
    pub include_values: Vec<(String, Getter)>,
}

/// Actions of a meta together with their notifiers
#[derive(Clone, Default)]
pub struct ActionSet {
    actions: Vec<Action>,
    notifiers: HashMap<(Method, usize), Arc<dyn Notifier>>,
}

impl ActionSet {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn filter_by_method(&self, method: Method) -> Vec<&Action> {
        self.actions.iter().filter(|a| a.method == method).collect()
    }

    /// True when at least one notifier listens to `method`
    pub fn has_notifiers(&self, method: Method) -> bool {
        self.notifiers.keys().any(|(m, _)| *m == method)
    }

    pub fn notifier(&self, method: Method, action_id: usize) -> Option<&Arc<dyn Notifier>> {
        self.notifiers.get(&(method, action_id))
    }
}

impl fmt::Debug for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSet")
            .field("actions", &self.actions)
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

/// Compiled object type
#[derive(Debug, Clone)]
pub struct Meta {
    pub name: String,
    pub key: String,
    pub fields: Vec<FieldDescription>,
    pub actions: ActionSet,
    key_index: usize,
}

impl Meta {
    pub fn find_field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn key_field(&self) -> &FieldDescription {
        &self.fields[self.key_index]
    }

    /// Fields stored as columns of the meta's table
    pub fn table_fields(&self) -> Vec<&FieldDescription> {
        self.fields.iter().filter(|f| f.is_table_column()).collect()
    }

    pub fn table_field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.is_table_column())
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn table_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.name)
    }

    /// True when an outer field on this meta mirrors `field` of its parent meta
    pub fn is_back_link(&self, field: &FieldDescription) -> bool {
        self.fields.iter().any(|f| {
            f.is_outer()
                && f.outer_link_field.as_deref() == Some(field.name.as_str())
                && f.link_meta.as_deref() == Some(field.meta.as_str())
        })
    }
}

/// Name of the synthesized through object of a many-to-many field
pub fn through_meta_name(owner: &str, target: &str) -> String {
    format!("{}__{}", owner, target)
}

/// Name of an automatically added reverse outer field
pub fn reverse_field_name(owner: &str) -> String {
    format!("{}_set", owner)
}

/// Read interface over the schema layer
pub trait MetaStore: Send + Sync {
    fn get_meta(&self, name: &str) -> Result<Option<Arc<Meta>>>;

    /// Like `get_meta`, but a missing meta is an `ObjectClassNotFound` error
    fn require_meta(&self, name: &str) -> Result<Arc<Meta>> {
        self.get_meta(name)?
            .ok_or_else(|| EngineError::ObjectClassNotFound(name.to_string()))
    }
}

/// Builds a notifier for an action from its arguments and `active_if_not_root` flag
pub type NotifierFactory = Arc<dyn Fn(&[String], bool) -> Result<Arc<dyn Notifier>> + Send + Sync>;

/// In-memory schema store
pub struct MetaRegistry {
    descriptions: RwLock<BTreeMap<String, MetaDescription>>,
    metas: RwLock<HashMap<String, Arc<Meta>>>,
    notifier_factories: RwLock<HashMap<Protocol, NotifierFactory>>,
}

impl MetaRegistry {
    pub fn new() -> Self {
        let mut factories: HashMap<Protocol, NotifierFactory> = HashMap::new();
        factories.insert(
            Protocol::Test,
            Arc::new(|_args: &[String], active_if_not_root: bool| {
                Ok(Arc::new(TestNotifier::new(active_if_not_root)) as Arc<dyn Notifier>)
            }),
        );
        MetaRegistry {
            descriptions: RwLock::new(BTreeMap::new()),
            metas: RwLock::new(HashMap::new()),
            notifier_factories: RwLock::new(factories),
        }
    }

    /// Register (or replace) the notifier factory of a protocol
    pub fn register_notifier_factory<F>(&self, protocol: Protocol, factory: F)
    where
        F: Fn(&[String], bool) -> Result<Arc<dyn Notifier>> + Send + Sync + 'static,
    {
        self.notifier_factories.write().insert(protocol, Arc::new(factory));
    }

    /// Add one meta; its links must resolve against already known metas
    pub fn create(&self, description: MetaDescription) -> Result<Arc<Meta>> {
        let name = description.name.clone();
        self.create_many(vec![description])?;
        self.require_meta(&name)
    }

    /// Add several metas at once (mutually referencing metas)
    pub fn create_many(&self, descriptions: Vec<MetaDescription>) -> Result<()> {
        let mut candidate = self.descriptions.read().clone();
        for description in descriptions {
            if candidate.contains_key(&description.name) {
                return Err(EngineError::meta(&description.name, "Meta already exists"));
            }
            candidate.insert(description.name.clone(), description);
        }
        self.rebuild(candidate)
    }

    /// Replace the description of an existing meta
    pub fn update(&self, description: MetaDescription) -> Result<Arc<Meta>> {
        let name = description.name.clone();
        let mut candidate = self.descriptions.read().clone();
        if candidate.insert(name.clone(), description).is_none() {
            return Err(EngineError::ObjectClassNotFound(name));
        }
        self.rebuild(candidate)?;
        self.require_meta(&name)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut candidate = self.descriptions.read().clone();
        if candidate.remove(name).is_none() {
            return Err(EngineError::ObjectClassNotFound(name.to_string()));
        }
        self.rebuild(candidate)
    }

    /// Names of every compiled meta, through objects included
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metas.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn rebuild(&self, descriptions: BTreeMap<String, MetaDescription>) -> Result<()> {
        let expanded = expand_descriptions(&descriptions)?;
        let factories = self.notifier_factories.read().clone();
        let mut metas = HashMap::new();
        for description in expanded.values() {
            let meta = compile_meta(description, &expanded, &factories)?;
            metas.insert(meta.name.clone(), Arc::new(meta));
        }
        *self.descriptions.write() = descriptions;
        *self.metas.write() = metas;
        tracing::debug!(count = self.metas.read().len(), "meta registry rebuilt");
        Ok(())
    }
}

impl Default for MetaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore for MetaRegistry {
    fn get_meta(&self, name: &str) -> Result<Option<Arc<Meta>>> {
        Ok(self.metas.read().get(name).cloned())
    }
}

/// Add through objects and reverse outer fields to a set of descriptions
fn expand_descriptions(
    descriptions: &BTreeMap<String, MetaDescription>,
) -> Result<BTreeMap<String, MetaDescription>> {
    let mut expanded = descriptions.clone();

    for description in descriptions.values() {
        for field in &description.fields {
            if field.field_type != FieldType::Objects {
                continue;
            }
            let target = field.link_meta.as_deref().ok_or_else(|| {
                EngineError::meta(&description.name, format!("Field '{}' has no link meta", field.name))
            })?;
            let through = through_meta_name(&description.name, target);
            if expanded.contains_key(&through) {
                continue;
            }
            let through_description = MetaDescription::new(&through, "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::object(&description.name, &description.name))
                .with_field(FieldSpec::object(target, target));
            expanded.insert(through, through_description);
        }
    }

    let mut reverse_fields: Vec<(String, FieldSpec)> = Vec::new();
    for description in expanded.values() {
        for field in &description.fields {
            if field.link_type != LinkType::Inner {
                continue;
            }
            let targets: Vec<String> = match field.field_type {
                FieldType::Object => field.link_meta.iter().cloned().collect(),
                FieldType::Generic => field.link_meta_list.clone(),
                _ => continue,
            };
            for target in targets {
                let Some(target_description) = expanded.get(&target) else {
                    return Err(EngineError::meta(
                        &description.name,
                        format!("Field '{}' references meta '{}', which does not exist", field.name, target),
                    ));
                };
                let declared = target_description.fields.iter().any(|f| {
                    f.link_type == LinkType::Outer
                        && f.link_meta.as_deref() == Some(description.name.as_str())
                        && f.outer_link_field.as_deref() == Some(field.name.as_str())
                });
                let name = reverse_field_name(&description.name);
                let taken = target_description.find_field(&name).is_some()
                    || reverse_fields.iter().any(|(t, f)| *t == target && f.name == name);
                if declared || taken {
                    continue;
                }
                let reverse = match field.field_type {
                    FieldType::Generic => FieldSpec::generic_outer(&name, &description.name, &field.name),
                    _ => FieldSpec::array(&name, &description.name, &field.name),
                }
                .retrieve_mode(false);
                reverse_fields.push((target, reverse));
            }
        }
    }
    for (target, field) in reverse_fields {
        if let Some(description) = expanded.get_mut(&target) {
            description.fields.push(field);
        }
    }
    Ok(expanded)
}

fn compile_meta(
    description: &MetaDescription,
    all: &BTreeMap<String, MetaDescription>,
    factories: &HashMap<Protocol, NotifierFactory>,
) -> Result<Meta> {
    let name = description.name.as_str();
    let key_index = description
        .fields
        .iter()
        .position(|f| f.name == description.key)
        .ok_or_else(|| EngineError::meta(name, format!("Key field '{}' is not declared", description.key)))?;
    if !description.fields[key_index].field_type.is_scalar() {
        return Err(EngineError::meta(name, "Key field must be a scalar"));
    }

    let mut fields = Vec::with_capacity(description.fields.len());
    for spec in &description.fields {
        if fields.iter().any(|f: &FieldDescription| f.name == spec.name) {
            return Err(EngineError::meta(name, format!("Field '{}' is declared twice", spec.name)));
        }
        fields.push(compile_field(name, spec, all)?);
    }

    let mut actions = Vec::with_capacity(description.actions.len());
    let mut notifiers = HashMap::new();
    for (id, spec) in description.actions.iter().enumerate() {
        let factory = factories.get(&spec.protocol).ok_or_else(|| {
            EngineError::meta(name, format!("Notifier factory not found for protocol {:?}", spec.protocol))
        })?;
        notifiers.insert((spec.method, id), factory(&spec.args, spec.active_if_not_root)?);
        let mut include_values = Vec::new();
        for (alias, raw) in &spec.include_values {
            let getter = Getter::from_json(raw)
                .ok_or_else(|| EngineError::meta(name, format!("Getter of '{}' is malformed", alias)))?;
            include_values.push((alias.clone(), getter));
        }
        actions.push(Action {
            id,
            method: spec.method,
            protocol: spec.protocol,
            args: spec.args.clone(),
            active_if_not_root: spec.active_if_not_root,
            include_values,
        });
    }

    Ok(Meta {
        name: name.to_string(),
        key: description.key.clone(),
        fields,
        actions: ActionSet { actions, notifiers },
        key_index,
    })
}

fn compile_field(owner: &str, spec: &FieldSpec, all: &BTreeMap<String, MetaDescription>) -> Result<FieldDescription> {
    let lookup = |meta: &str| {
        all.get(meta).ok_or_else(|| {
            EngineError::meta(
                owner,
                format!("Field '{}' references meta '{}', which does not exist", spec.name, meta),
            )
        })
    };

    let on_delete = if spec.link_type == LinkType::Inner
        && matches!(spec.field_type, FieldType::Object | FieldType::Generic)
    {
        Some(OnDeleteStrategy::from_verbose(&spec.on_delete).ok_or_else(|| {
            EngineError::meta(
                owner,
                format!("Failed to validate {}'s onDelete strategy '{}'", spec.name, spec.on_delete),
            )
        })?)
    } else {
        None
    };

    let mut link_key_type = None;
    let mut link_through = None;
    match spec.field_type {
        FieldType::Object | FieldType::Array | FieldType::Objects => {
            let target_name = spec
                .link_meta
                .as_deref()
                .ok_or_else(|| EngineError::meta(owner, format!("Field '{}' has no link meta", spec.name)))?;
            let target = lookup(target_name)?;
            link_key_type = target.find_field(&target.key).map(|k| k.field_type);
            if spec.field_type == FieldType::Objects {
                link_through = Some(through_meta_name(owner, target_name));
            }
        }
        FieldType::Generic => {
            if spec.link_type == LinkType::Inner {
                if spec.link_meta_list.is_empty() {
                    return Err(EngineError::meta(owner, format!("Generic field '{}' has no link metas", spec.name)));
                }
                for target in &spec.link_meta_list {
                    lookup(target)?;
                }
            } else if let Some(target) = spec.link_meta.as_deref() {
                lookup(target)?;
            }
        }
        _ => {}
    }

    if spec.link_type == LinkType::Outer {
        let target_name = spec
            .link_meta
            .as_deref()
            .ok_or_else(|| EngineError::meta(owner, format!("Outer field '{}' has no link meta", spec.name)))?;
        let target = lookup(target_name)?;
        let outer_name = spec.outer_link_field.as_deref().unwrap_or_default();
        let outer = target.find_field(outer_name).ok_or_else(|| {
            EngineError::meta(
                owner,
                format!(
                    "Field '{}' has incorrect outer link. Meta '{}' has no Field '{}'",
                    spec.name, target_name, outer_name
                ),
            )
        })?;
        let can_link = outer.link_type == LinkType::Inner
            && match outer.field_type {
                FieldType::Object => outer.link_meta.as_deref() == Some(owner),
                FieldType::Generic => outer.link_meta_list.iter().any(|m| m == owner),
                _ => false,
            };
        if !can_link {
            return Err(EngineError::meta(
                owner,
                format!(
                    "Field '{}' has incorrect outer link. Field '{}' of '{}' can't refer to '{}'",
                    spec.name, outer_name, target_name, owner
                ),
            ));
        }
    }

    Ok(FieldDescription {
        name: spec.name.clone(),
        meta: owner.to_string(),
        field_type: spec.field_type,
        link_type: spec.link_type,
        link_meta: spec.link_meta.clone(),
        link_meta_list: spec.link_meta_list.clone(),
        link_through,
        outer_link_field: spec.outer_link_field.clone(),
        link_key_type,
        optional: spec.optional,
        on_delete,
        retrieve_mode: spec.retrieve_mode,
        query_mode: spec.query_mode,
        now_on_create: spec.now_on_create,
        now_on_update: spec.now_on_update,
        default: DefaultValue::from_json(&spec.default),
        choices: spec.choices.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_a_and_b() -> MetaRegistry {
        let registry = MetaRegistry::new();
        registry
            .create(MetaDescription::new("a", "id").with_field(FieldSpec::key("id")))
            .unwrap();
        registry
            .create(
                MetaDescription::new("b", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::object("a", "a").optional()),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_reverse_outer_field_is_added() {
        let registry = registry_with_a_and_b();
        let a = registry.require_meta("a").unwrap();
        let reverse = a.find_field("b_set").unwrap();
        assert_eq!(reverse.field_type, FieldType::Array);
        assert_eq!(reverse.link_type, LinkType::Outer);
        assert_eq!(reverse.link_meta.as_deref(), Some("b"));
        assert!(!reverse.retrieve_mode);
        assert!(reverse.query_mode);

        let b = registry.require_meta("b").unwrap();
        let link = b.find_field("a").unwrap();
        assert_eq!(link.on_delete_strategy(), OnDeleteStrategy::Cascade);
        assert_eq!(link.link_key_type, Some(FieldType::Number));
        assert_eq!(link.reverse_outer_field(&a).map(|f| f.name.as_str()), Some("b_set"));
    }

    #[test]
    fn test_through_meta_is_synthesized() {
        let registry = MetaRegistry::new();
        registry
            .create(MetaDescription::new("b", "id").with_field(FieldSpec::key("id")))
            .unwrap();
        registry
            .create(
                MetaDescription::new("a", "id")
                    .with_field(FieldSpec::key("id"))
                    .with_field(FieldSpec::objects("bs", "b")),
            )
            .unwrap();

        let through = registry.require_meta("a__b").unwrap();
        assert_eq!(through.fields.len(), 3);
        assert!(through.find_field("a").is_some());
        assert!(through.find_field("b").is_some());

        let a = registry.require_meta("a").unwrap();
        assert_eq!(a.find_field("bs").unwrap().link_through.as_deref(), Some("a__b"));
        let b = registry.require_meta("b").unwrap();
        assert!(b.find_field("a__b_set").is_some());
    }

    #[test]
    fn test_outer_link_must_resolve() {
        let registry = MetaRegistry::new();
        registry
            .create(MetaDescription::new("b", "id").with_field(FieldSpec::key("id")))
            .unwrap();
        let result = registry.create(
            MetaDescription::new("a", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::array("bs", "b", "missing")),
        );
        assert!(matches!(result, Err(EngineError::Meta { .. })));
        assert!(registry.get_meta("a").unwrap().is_none());
    }

    #[test]
    fn test_invalid_on_delete_is_rejected() {
        let registry = MetaRegistry::new();
        registry
            .create(MetaDescription::new("a", "id").with_field(FieldSpec::key("id")))
            .unwrap();
        let result = registry.create(
            MetaDescription::new("b", "id")
                .with_field(FieldSpec::key("id"))
                .with_field(FieldSpec::object("a", "a").on_delete("explode")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_description_from_json() {
        let description = MetaDescription::from_json_str(
            r#"{
                "name": "person",
                "key": "id",
                "fields": [
                    {"name": "id", "type": "number", "optional": true, "def": {"func": "nextval"}},
                    {"name": "kind", "type": "enum", "enum": ["a", "b"]},
                    {"name": "created", "type": "datetime", "optional": true, "nowOnCreate": true}
                ],
                "actions": [
                    {"method": "create", "protocol": "TEST", "includeValues": {"k": "kind"}}
                ]
            }"#,
        )
        .unwrap();
        let registry = MetaRegistry::new();
        let meta = registry.create(description).unwrap();
        assert_eq!(meta.key_field().default, Some(DefaultValue::NextVal));
        assert_eq!(meta.find_field("kind").unwrap().choices, vec!["a", "b"]);
        assert!(meta.find_field("created").unwrap().now_on_create);
        assert!(meta.actions.has_notifiers(Method::Create));
        assert!(!meta.actions.has_notifiers(Method::Remove));
        assert_eq!(
            meta.actions.actions()[0].include_values,
            vec![("k".to_string(), Getter::Path("kind".to_string()))]
        );
    }

    #[test]
    fn test_unknown_protocol_factory() {
        let registry = MetaRegistry::new();
        let result = registry.create(
            MetaDescription::new("a", "id")
                .with_field(FieldSpec::key("id"))
                .with_action(ActionSpec::new(Method::Create, Protocol::Rest)),
        );
        assert!(result.is_err());
    }
}
