//! Task encoding
//!
//! A [`Task`] describes one remote operation as a kind plus a positional
//! operand list. The caller side builds tasks through the typed constructors;
//! the worker side turns the raw operands back into a [`TaskOperation`].

use serde_json::{json, Value as JsonValue};

use crate::channel::Channel;
use crate::protocol::ErrorInfo;

/// Kinds of remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskKind {
    InvokeFunction = 1,
    GetStaticProperty = 2,
    SetStaticProperty = 3,
    InvokeStaticMethod = 4,
    InstantiateObject = 5,
    GetInstanceProperty = 6,
    SetInstanceProperty = 7,
    InvokeInstanceMethod = 8,
    DisposeObject = 9,
}

impl TaskKind {
    pub const ALL: [TaskKind; 9] = [
        TaskKind::InvokeFunction,
        TaskKind::GetStaticProperty,
        TaskKind::SetStaticProperty,
        TaskKind::InvokeStaticMethod,
        TaskKind::InstantiateObject,
        TaskKind::GetInstanceProperty,
        TaskKind::SetInstanceProperty,
        TaskKind::InvokeInstanceMethod,
        TaskKind::DisposeObject,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Invocable kinds may carry a channel
    pub fn is_invocable(self) -> bool {
        self.channel_flag_index().is_some()
    }

    /// Operand slot holding the has-channel flag
    fn channel_flag_index(self) -> Option<usize> {
        match self {
            TaskKind::InvokeFunction | TaskKind::InvokeInstanceMethod => Some(3),
            TaskKind::InvokeStaticMethod => Some(4),
            _ => None,
        }
    }
}

impl TryFrom<u8> for TaskKind {
    type Error = ErrorInfo;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| ErrorInfo::invalid_task_kind(code))
    }
}

/// A call argument: either a plain value or a channel
#[derive(Debug, Clone)]
pub enum Argument {
    Value(JsonValue),
    Channel(Channel),
}

impl From<JsonValue> for Argument {
    fn from(value: JsonValue) -> Self {
        Argument::Value(value)
    }
}

impl From<Channel> for Argument {
    fn from(channel: Channel) -> Self {
        Argument::Channel(channel)
    }
}

/// Split call arguments into serializable values and channels
fn split_arguments(args: Vec<Argument>) -> (Vec<JsonValue>, Vec<Channel>) {
    let mut values = Vec::with_capacity(args.len());
    let mut channels = Vec::new();
    for arg in args {
        match arg {
            Argument::Value(value) => values.push(value),
            Argument::Channel(channel) => channels.push(channel),
        }
    }
    (values, channels)
}

/// Immutable description of one remote operation
#[derive(Debug, Clone)]
pub struct Task {
    kind: TaskKind,
    operands: Vec<JsonValue>,
    channels: Vec<Channel>,
}

impl Task {
    /// Build a task from a raw kind code
    pub fn new(kind: u8, operands: Vec<JsonValue>) -> Result<Self, ErrorInfo> {
        Ok(Self::with_kind(TaskKind::try_from(kind)?, operands))
    }

    fn with_kind(kind: TaskKind, operands: Vec<JsonValue>) -> Self {
        Self {
            kind,
            operands,
            channels: Vec::new(),
        }
    }

    fn invocable(kind: TaskKind, mut operands: Vec<JsonValue>, args: Vec<Argument>) -> Self {
        let (values, channels) = split_arguments(args);
        operands.push(JsonValue::Array(values));
        operands.push(JsonValue::Bool(false));
        Self {
            kind,
            operands,
            channels,
        }
    }

    pub fn invoke_function(module: &str, function: &str, args: Vec<Argument>) -> Self {
        Self::invocable(
            TaskKind::InvokeFunction,
            vec![json!(module), json!(function)],
            args,
        )
    }

    pub fn get_static_property(module: &str, export: &str, property: &str) -> Self {
        Self::with_kind(
            TaskKind::GetStaticProperty,
            vec![json!(module), json!(export), json!(property)],
        )
    }

    pub fn set_static_property(module: &str, export: &str, property: &str, value: JsonValue) -> Self {
        Self::with_kind(
            TaskKind::SetStaticProperty,
            vec![json!(module), json!(export), json!(property), value],
        )
    }

    pub fn invoke_static_method(module: &str, export: &str, method: &str, args: Vec<Argument>) -> Self {
        Self::invocable(
            TaskKind::InvokeStaticMethod,
            vec![json!(module), json!(export), json!(method)],
            args,
        )
    }

    pub fn instantiate_object(module: &str, export: &str, args: Vec<JsonValue>) -> Self {
        Self::with_kind(
            TaskKind::InstantiateObject,
            vec![json!(module), json!(export), JsonValue::Array(args)],
        )
    }

    pub fn get_instance_property(object_id: u64, property: &str) -> Self {
        Self::with_kind(
            TaskKind::GetInstanceProperty,
            vec![json!(object_id), json!(property)],
        )
    }

    pub fn set_instance_property(object_id: u64, property: &str, value: JsonValue) -> Self {
        Self::with_kind(
            TaskKind::SetInstanceProperty,
            vec![json!(object_id), json!(property), value],
        )
    }

    pub fn invoke_instance_method(object_id: u64, method: &str, args: Vec<Argument>) -> Self {
        Self::invocable(
            TaskKind::InvokeInstanceMethod,
            vec![json!(object_id), json!(method)],
            args,
        )
    }

    pub fn dispose_object(object_id: u64) -> Self {
        Self::with_kind(TaskKind::DisposeObject, vec![json!(object_id)])
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn operands(&self) -> &[JsonValue] {
        &self.operands
    }

    /// Channels stripped from the call arguments
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Operands as sent on the wire, with the has-channel flag filled in
    pub fn wire_operands(&self, has_channel: bool) -> Vec<JsonValue> {
        let mut operands = self.operands.clone();
        if let Some(index) = self.kind.channel_flag_index() {
            if operands.len() <= index {
                operands.resize(index + 1, JsonValue::Null);
            }
            operands[index] = JsonValue::Bool(has_channel);
        }
        operands
    }
}

/// A decoded task, as executed by a worker
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOperation {
    InvokeFunction {
        module: String,
        function: String,
        args: Vec<JsonValue>,
        has_channel: bool,
    },
    GetStaticProperty {
        module: String,
        export: String,
        property: String,
    },
    SetStaticProperty {
        module: String,
        export: String,
        property: String,
        value: JsonValue,
    },
    InvokeStaticMethod {
        module: String,
        export: String,
        method: String,
        args: Vec<JsonValue>,
        has_channel: bool,
    },
    InstantiateObject {
        module: String,
        export: String,
        args: Vec<JsonValue>,
    },
    GetInstanceProperty {
        object_id: u64,
        property: String,
    },
    SetInstanceProperty {
        object_id: u64,
        property: String,
        value: JsonValue,
    },
    InvokeInstanceMethod {
        object_id: u64,
        method: String,
        args: Vec<JsonValue>,
        has_channel: bool,
    },
    DisposeObject {
        object_id: u64,
    },
}

struct Operands {
    kind: TaskKind,
    values: std::vec::IntoIter<JsonValue>,
    position: usize,
}

impl Operands {
    fn next(&mut self) -> Result<JsonValue, ErrorInfo> {
        self.position += 1;
        self.values.next().ok_or_else(|| {
            ErrorInfo::invalid_operands(format!(
                "{:?} is missing operand {}",
                self.kind, self.position
            ))
        })
    }

    fn mismatch(&self, expected: &str) -> ErrorInfo {
        ErrorInfo::invalid_operands(format!(
            "{:?} operand {} must be {}",
            self.kind, self.position, expected
        ))
    }

    fn string(&mut self) -> Result<String, ErrorInfo> {
        match self.next()? {
            JsonValue::String(value) => Ok(value),
            _ => Err(self.mismatch("a string")),
        }
    }

    fn id(&mut self) -> Result<u64, ErrorInfo> {
        let value = self.next()?;
        value.as_u64().ok_or_else(|| self.mismatch("an object id"))
    }

    fn array(&mut self) -> Result<Vec<JsonValue>, ErrorInfo> {
        match self.next()? {
            JsonValue::Array(values) => Ok(values),
            _ => Err(self.mismatch("an array")),
        }
    }

    // Absent or null means no channel
    fn flag(&mut self) -> bool {
        matches!(self.values.next(), Some(JsonValue::Bool(true)))
    }
}

impl TaskOperation {
    /// Decode wire operands for the given kind
    pub fn decode(kind: TaskKind, operands: Vec<JsonValue>) -> Result<Self, ErrorInfo> {
        let mut ops = Operands {
            kind,
            values: operands.into_iter(),
            position: 0,
        };
        let operation = match kind {
            TaskKind::InvokeFunction => TaskOperation::InvokeFunction {
                module: ops.string()?,
                function: ops.string()?,
                args: ops.array()?,
                has_channel: ops.flag(),
            },
            TaskKind::GetStaticProperty => TaskOperation::GetStaticProperty {
                module: ops.string()?,
                export: ops.string()?,
                property: ops.string()?,
            },
            TaskKind::SetStaticProperty => TaskOperation::SetStaticProperty {
                module: ops.string()?,
                export: ops.string()?,
                property: ops.string()?,
                value: ops.next()?,
            },
            TaskKind::InvokeStaticMethod => TaskOperation::InvokeStaticMethod {
                module: ops.string()?,
                export: ops.string()?,
                method: ops.string()?,
                args: ops.array()?,
                has_channel: ops.flag(),
            },
            TaskKind::InstantiateObject => TaskOperation::InstantiateObject {
                module: ops.string()?,
                export: ops.string()?,
                args: ops.array()?,
            },
            TaskKind::GetInstanceProperty => TaskOperation::GetInstanceProperty {
                object_id: ops.id()?,
                property: ops.string()?,
            },
            TaskKind::SetInstanceProperty => TaskOperation::SetInstanceProperty {
                object_id: ops.id()?,
                property: ops.string()?,
                value: ops.next()?,
            },
            TaskKind::InvokeInstanceMethod => TaskOperation::InvokeInstanceMethod {
                object_id: ops.id()?,
                method: ops.string()?,
                args: ops.array()?,
                has_channel: ops.flag(),
            },
            TaskKind::DisposeObject => TaskOperation::DisposeObject {
                object_id: ops.id()?,
            },
        };
        Ok(operation)
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskOperation::InvokeFunction { .. } => TaskKind::InvokeFunction,
            TaskOperation::GetStaticProperty { .. } => TaskKind::GetStaticProperty,
            TaskOperation::SetStaticProperty { .. } => TaskKind::SetStaticProperty,
            TaskOperation::InvokeStaticMethod { .. } => TaskKind::InvokeStaticMethod,
            TaskOperation::InstantiateObject { .. } => TaskKind::InstantiateObject,
            TaskOperation::GetInstanceProperty { .. } => TaskKind::GetInstanceProperty,
            TaskOperation::SetInstanceProperty { .. } => TaskKind::SetInstanceProperty,
            TaskOperation::InvokeInstanceMethod { .. } => TaskKind::InvokeInstanceMethod,
            TaskOperation::DisposeObject { .. } => TaskKind::DisposeObject,
        }
    }

    pub fn has_channel(&self) -> bool {
        match self {
            TaskOperation::InvokeFunction { has_channel, .. }
            | TaskOperation::InvokeStaticMethod { has_channel, .. }
            | TaskOperation::InvokeInstanceMethod { has_channel, .. } => *has_channel,
            _ => false,
        }
    }
}
