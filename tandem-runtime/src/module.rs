//! Module model for code running inside a worker
//!
//! A [`Module`] is a table of named exports. Functions and classes can be
//! reached remotely; plain values are only visible in the module shape.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tandem_ipc::{CallResult, Channel, ErrorInfo, ErrorKind, MemberKind};

static NULL: JsonValue = JsonValue::Null;

/// Arguments of one remote call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<JsonValue>,
    /// Channel supplied by the caller, if any
    pub channel: Option<Channel>,
}

impl CallArgs {
    pub fn new(args: Vec<JsonValue>) -> Self {
        Self {
            args,
            channel: None,
        }
    }

    pub fn with_channel(args: Vec<JsonValue>, channel: Option<Channel>) -> Self {
        Self { args, channel }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument at `index`, `null` when absent
    pub fn get(&self, index: usize) -> &JsonValue {
        self.args.get(index).unwrap_or(&NULL)
    }

    pub fn f64(&self, index: usize) -> Result<f64, ErrorInfo> {
        self.get(index)
            .as_f64()
            .ok_or_else(|| ErrorInfo::application(format!("Argument {} must be a number", index)))
    }

    pub fn i64(&self, index: usize) -> Result<i64, ErrorInfo> {
        self.get(index)
            .as_i64()
            .ok_or_else(|| ErrorInfo::application(format!("Argument {} must be an integer", index)))
    }

    pub fn str(&self, index: usize) -> Result<&str, ErrorInfo> {
        self.get(index)
            .as_str()
            .ok_or_else(|| ErrorInfo::application(format!("Argument {} must be a string", index)))
    }

    pub fn channel(&self) -> Result<&Channel, ErrorInfo> {
        self.channel
            .as_ref()
            .ok_or_else(|| ErrorInfo::new(ErrorKind::ChannelNotFound, "Call was made without a channel"))
    }
}

/// A callable export or static method
pub type FunctionHandler = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// An instance method; receives the instance fields
pub type MethodHandler =
    Arc<dyn Fn(Fields, CallArgs) -> BoxFuture<'static, CallResult> + Send + Sync>;

/// Builds an instance from constructor arguments
pub type Constructor =
    Arc<dyn Fn(Vec<JsonValue>) -> Result<Arc<dyn RemoteObject>, ErrorInfo> + Send + Sync>;

/// Box an async closure as a [`FunctionHandler`]
pub fn handler<F, Fut>(f: F) -> FunctionHandler
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

fn method_access(name: &str) -> ErrorInfo {
    ErrorInfo::new(
        ErrorKind::InvalidMemberAccess,
        format!("'{}' is a method and has no value", name),
    )
}

fn data_invocation(name: &str) -> ErrorInfo {
    ErrorInfo::new(
        ErrorKind::InvalidMemberAccess,
        format!("'{}' is not a method", name),
    )
}

/// Static members of a function or class export
#[derive(Default)]
pub struct StaticMembers {
    data: Mutex<BTreeMap<String, JsonValue>>,
    methods: BTreeMap<String, FunctionHandler>,
}

impl StaticMembers {
    pub fn kinds(&self) -> BTreeMap<String, MemberKind> {
        let mut kinds: BTreeMap<_, _> = self
            .methods
            .keys()
            .map(|name| (name.clone(), MemberKind::Method))
            .collect();
        for name in self.data.lock().keys() {
            kinds.entry(name.clone()).or_insert(MemberKind::Data);
        }
        kinds
    }

    /// Read a data member; unknown names read as `null`
    pub fn get(&self, name: &str) -> CallResult {
        if self.methods.contains_key(name) {
            return Err(method_access(name));
        }
        Ok(self.data.lock().get(name).cloned().unwrap_or(JsonValue::Null))
    }

    pub fn set(&self, name: &str, value: JsonValue) -> Result<(), ErrorInfo> {
        if self.methods.contains_key(name) {
            return Err(ErrorInfo::method_assignment(name));
        }
        self.data.lock().insert(name.to_string(), value);
        Ok(())
    }

    pub fn method(&self, name: &str) -> Result<FunctionHandler, ErrorInfo> {
        if let Some(method) = self.methods.get(name) {
            return Ok(method.clone());
        }
        if self.data.lock().contains_key(name) {
            return Err(data_invocation(name));
        }
        Err(ErrorInfo::member_not_found(name))
    }
}

/// A top-level function export
pub struct FunctionExport {
    handler: FunctionHandler,
    statics: StaticMembers,
}

impl FunctionExport {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        Self {
            handler: handler(f),
            statics: StaticMembers::default(),
        }
    }

    /// Add a static data member
    pub fn property(self, name: impl Into<String>, value: JsonValue) -> Self {
        self.statics.data.lock().insert(name.into(), value);
        self
    }

    /// Add a static method
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.statics.methods.insert(name.into(), handler(f));
        self
    }

    pub async fn call(&self, args: CallArgs) -> CallResult {
        (self.handler)(args).await
    }
}

/// A top-level class export
pub struct ClassExport {
    constructor: Constructor,
    statics: StaticMembers,
}

impl ClassExport {
    pub fn new<F, O>(constructor: F) -> Self
    where
        F: Fn(Vec<JsonValue>) -> Result<O, ErrorInfo> + Send + Sync + 'static,
        O: RemoteObject + 'static,
    {
        let constructor: Constructor = Arc::new(move |args| {
            let object: Arc<dyn RemoteObject> = Arc::new(constructor(args)?);
            Ok(object)
        });
        Self {
            constructor,
            statics: StaticMembers::default(),
        }
    }

    /// Add a static data member
    pub fn property(self, name: impl Into<String>, value: JsonValue) -> Self {
        self.statics.data.lock().insert(name.into(), value);
        self
    }

    /// Add a static method
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.statics.methods.insert(name.into(), handler(f));
        self
    }

    pub fn construct(&self, args: Vec<JsonValue>) -> Result<Arc<dyn RemoteObject>, ErrorInfo> {
        (self.constructor)(args)
    }
}

/// One named export of a module
pub enum Export {
    Function(FunctionExport),
    Class(ClassExport),
    Value(JsonValue),
}

impl Export {
    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Export::Function(_) => "function",
            Export::Class(_) => "class",
            Export::Value(value) => json_type_name(value),
        }
    }

    pub fn statics(&self) -> Option<&StaticMembers> {
        match self {
            Export::Function(f) => Some(&f.statics),
            Export::Class(c) => Some(&c.statics),
            Export::Value(_) => None,
        }
    }

    pub fn shape(&self) -> ExportShape {
        match self {
            Export::Function(f) => ExportShape::Function {
                statics: f.statics.kinds(),
            },
            Export::Class(c) => ExportShape::Class {
                statics: c.statics.kinds(),
            },
            Export::Value(value) => ExportShape::Value {
                type_name: json_type_name(value).to_string(),
            },
        }
    }
}

impl From<FunctionExport> for Export {
    fn from(export: FunctionExport) -> Self {
        Export::Function(export)
    }
}

impl From<ClassExport> for Export {
    fn from(export: ClassExport) -> Self {
        Export::Class(export)
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Shape of an export as seen by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportShape {
    Function { statics: BTreeMap<String, MemberKind> },
    Class { statics: BTreeMap<String, MemberKind> },
    Value { type_name: String },
}

/// Shape of a whole module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleShape {
    pub exports: BTreeMap<String, ExportShape>,
}

/// A loaded module
#[derive(Default)]
pub struct Module {
    exports: BTreeMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: impl Into<String>, export: impl Into<Export>) -> Self {
        self.exports.insert(name.into(), export.into());
        self
    }

    /// Export a plain function
    pub fn function<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        self.export(name, FunctionExport::new(f))
    }

    /// Export a plain value
    pub fn value(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.exports.insert(name.into(), Export::Value(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Export> {
        self.exports.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }

    pub fn shape(&self) -> ModuleShape {
        ModuleShape {
            exports: self
                .exports
                .iter()
                .map(|(name, export)| (name.clone(), export.shape()))
                .collect(),
        }
    }
}

/// A live object owned by a worker
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Own members first, then inherited ones. Names may repeat.
    fn members(&self) -> Vec<(String, MemberKind)>;

    fn get(&self, name: &str) -> CallResult;

    fn set(&self, name: &str, value: JsonValue) -> Result<(), ErrorInfo>;

    async fn invoke(&self, name: &str, args: CallArgs) -> CallResult;
}

/// Member-kind map of an object, keeping the first kind seen per name
pub fn member_kinds(object: &dyn RemoteObject) -> BTreeMap<String, MemberKind> {
    let mut kinds = BTreeMap::new();
    for (name, kind) in object.members() {
        kinds.entry(name).or_insert(kind);
    }
    kinds
}

/// Instance fields shared with method handlers
#[derive(Debug, Clone, Default)]
pub struct Fields(Arc<Mutex<BTreeMap<String, JsonValue>>>);

impl Fields {
    /// Field value, `null` when absent
    pub fn get(&self, name: &str) -> JsonValue {
        self.0.lock().get(name).cloned().unwrap_or(JsonValue::Null)
    }

    pub fn set(&self, name: impl Into<String>, value: JsonValue) {
        self.0.lock().insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.lock().contains_key(name)
    }

    /// Run `f` with exclusive access to all fields
    pub fn update<R>(&self, f: impl FnOnce(&mut BTreeMap<String, JsonValue>) -> R) -> R {
        f(&mut self.0.lock())
    }

    fn names(&self) -> Vec<String> {
        self.0.lock().keys().cloned().collect()
    }
}

/// Method table shared by all instances of a class
#[derive(Default)]
pub struct Prototype {
    methods: BTreeMap<String, MethodHandler>,
    parent: Option<Arc<Prototype>>,
}

impl Prototype {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inherit methods from `parent`
    pub fn extends(parent: Arc<Prototype>) -> Self {
        Self {
            methods: BTreeMap::new(),
            parent: Some(parent),
        }
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Fields, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let method: MethodHandler = Arc::new(move |fields, args| f(fields, args).boxed());
        self.methods.insert(name.into(), method);
        self
    }

    fn find(&self, name: &str) -> Option<MethodHandler> {
        match self.methods.get(name) {
            Some(method) => Some(method.clone()),
            None => self.parent.as_ref().and_then(|parent| parent.find(name)),
        }
    }

    fn collect_members(&self, members: &mut Vec<(String, MemberKind)>) {
        members.extend(self.methods.keys().map(|name| (name.clone(), MemberKind::Method)));
        if let Some(parent) = &self.parent {
            parent.collect_members(members);
        }
    }
}

/// General purpose object made of data fields and a prototype chain
pub struct DynamicObject {
    fields: Fields,
    prototype: Arc<Prototype>,
}

impl DynamicObject {
    pub fn new(prototype: Arc<Prototype>) -> Self {
        Self {
            fields: Fields::default(),
            prototype,
        }
    }

    pub fn with_field(self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.set(name, value);
        self
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

#[async_trait]
impl RemoteObject for DynamicObject {
    fn members(&self) -> Vec<(String, MemberKind)> {
        let mut members: Vec<_> = self
            .fields
            .names()
            .into_iter()
            .map(|name| (name, MemberKind::Data))
            .collect();
        self.prototype.collect_members(&mut members);
        members
    }

    fn get(&self, name: &str) -> CallResult {
        if self.fields.contains(name) {
            return Ok(self.fields.get(name));
        }
        if self.prototype.find(name).is_some() {
            return Err(method_access(name));
        }
        Ok(JsonValue::Null)
    }

    fn set(&self, name: &str, value: JsonValue) -> Result<(), ErrorInfo> {
        if !self.fields.contains(name) && self.prototype.find(name).is_some() {
            return Err(ErrorInfo::method_assignment(name));
        }
        self.fields.set(name, value);
        Ok(())
    }

    async fn invoke(&self, name: &str, args: CallArgs) -> CallResult {
        if self.fields.contains(name) {
            return Err(data_invocation(name));
        }
        match self.prototype.find(name) {
            Some(method) => method(self.fields.clone(), args).await,
            None => Err(ErrorInfo::member_not_found(name)),
        }
    }
}
