//! Records produced by a collection run. Serialized as camelCase JSON.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeValueKind {
    LocalVariable,
    Field,
    ArrayElement,
    ReturnValue,
}

/// Immediate rendering of a value: a scalar, a string, or the immediate
/// renderings of an array's first elements.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RenderedValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Text(String),
    Sequence(Vec<RenderedValue>),
}

/// Children of an object or array value.
///
/// `NotExpanded` marks a value whose expansion budget ran out; it is never
/// conflated with an object that has no fields or an empty array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "values", rename_all = "camelCase")]
pub enum Nested {
    NotExpanded,
    Fields(Vec<RuntimeValue>),
    Elements(Vec<RuntimeValue>),
}

impl Nested {
    pub fn children(&self) -> &[RuntimeValue] {
        match self {
            Nested::NotExpanded => &[],
            Nested::Fields(values) | Nested::Elements(values) => values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeValue {
    pub kind: RuntimeValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: RenderedValue,
    /// Nesting level below the captured root (roots are 0).
    pub depth: usize,
    /// `None` for scalars, strings and wrapper values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Nested>,
}

impl RuntimeValue {
    /// Deepest `depth` in this value's tree.
    pub fn max_depth(&self) -> usize {
        self.nested
            .as_ref()
            .map(|nested| {
                nested
                    .children()
                    .iter()
                    .map(RuntimeValue::max_depth)
                    .max()
                    .unwrap_or(self.depth)
            })
            .unwrap_or(self.depth)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSnapshot {
    /// 1-based position in the stack (1 is the suspended frame).
    pub index: usize,
    /// `declaring.Type:line`.
    pub location: String,
    /// `method:line, declaring.Type` for each application frame of the thread.
    pub stack_trace: Vec<String>,
    /// Visible locals, then the frame type's fields.
    pub values: Vec<RuntimeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHit {
    /// Source path relative to the source root, e.g. `foo/Bar.java`.
    pub file: String,
    pub line: u32,
    pub frames: Vec<FrameSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodExitRecord {
    pub method_name: String,
    pub return_type: String,
    pub location: String,
    pub arguments: Vec<RuntimeValue>,
    pub stack_trace: Vec<String>,
    pub return_value: RuntimeValue,
}

/// Everything captured during one session, in event order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResults {
    pub breakpoint_hits: Vec<BreakpointHit>,
    pub method_exits: Vec<MethodExitRecord>,
}
