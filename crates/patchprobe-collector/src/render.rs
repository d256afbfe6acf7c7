//! Immediate rendering of JDWP values.

use patchprobe_jdwp::{JdwpClient, JdwpError, JdwpValue, ObjectId, ObjectTag, ReferenceTypeId};

use crate::model::RenderedValue;

/// Boxed primitives (and `String`) rendered by their content rather than
/// their type name.
pub static WRAPPER_TYPES: &[&str] = &[
    "java.lang.Integer",
    "java.lang.Long",
    "java.lang.Double",
    "java.lang.Float",
    "java.lang.Boolean",
    "java.lang.Character",
    "java.lang.Byte",
    "java.lang.Short",
];

const STRING_TYPE: &str = "java.lang.String";

/// What a value handle is, resolved once per value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Null,
    Void,
    Primitive(JdwpValue),
    String {
        object: ObjectId,
    },
    Wrapper {
        object: ObjectId,
        type_id: ReferenceTypeId,
        type_name: String,
    },
    Array {
        object: ObjectId,
        type_name: String,
    },
    Object {
        object: ObjectId,
        type_id: ReferenceTypeId,
        type_name: String,
    },
}

impl ValueKind {
    /// Runtime type name; `None` for null.
    pub fn type_name(&self) -> Option<String> {
        match self {
            ValueKind::Null => None,
            ValueKind::Void => Some("void".to_string()),
            ValueKind::Primitive(value) => value.primitive_type_name().map(str::to_string),
            ValueKind::String { .. } => Some(STRING_TYPE.to_string()),
            ValueKind::Wrapper { type_name, .. }
            | ValueKind::Array { type_name, .. }
            | ValueKind::Object { type_name, .. } => Some(type_name.clone()),
        }
    }
}

pub fn classify<C: JdwpClient + ?Sized>(
    client: &mut C,
    value: &JdwpValue,
) -> Result<ValueKind, JdwpError> {
    let object = match value {
        JdwpValue::Null => return Ok(ValueKind::Null),
        JdwpValue::Void => return Ok(ValueKind::Void),
        JdwpValue::Object(object) => *object,
        primitive => return Ok(ValueKind::Primitive(primitive.clone())),
    };
    if object.tag == ObjectTag::String {
        return Ok(ValueKind::String { object: object.id });
    }

    let type_id = client.object_type(object.id)?;
    let type_name = client.type_name(type_id)?;
    Ok(match object.tag {
        ObjectTag::Array => ValueKind::Array {
            object: object.id,
            type_name,
        },
        _ if type_name == STRING_TYPE => ValueKind::String { object: object.id },
        _ if WRAPPER_TYPES.contains(&type_name.as_str()) => ValueKind::Wrapper {
            object: object.id,
            type_id,
            type_name,
        },
        _ => ValueKind::Object {
            object: object.id,
            type_id,
            type_name,
        },
    })
}

/// Render a classified value. Arrays render as their first `array_bound`
/// non-null elements; elements that are themselves arrays or objects render
/// as their type name.
///
/// Never fails: protocol errors render as null.
pub fn render<C: JdwpClient + ?Sized>(
    client: &mut C,
    kind: &ValueKind,
    array_bound: usize,
) -> RenderedValue {
    let result = match kind {
        ValueKind::Array { object, .. } => {
            non_null_elements(client, *object, array_bound).map(|elements| {
                RenderedValue::Sequence(
                    elements
                        .iter()
                        .map(|element| render_element(client, element))
                        .collect(),
                )
            })
        }
        other => render_scalar(client, other),
    };
    result.unwrap_or_else(|err| {
        tracing::debug!(target = "patchprobe.collector", ?kind, error = %err, "failed to render value");
        RenderedValue::Null
    })
}

fn render_element<C: JdwpClient + ?Sized>(client: &mut C, value: &JdwpValue) -> RenderedValue {
    let rendered = classify(client, value).and_then(|kind| match &kind {
        ValueKind::Array { type_name, .. } => Ok(RenderedValue::Text(type_name.clone())),
        other => render_scalar(client, other),
    });
    rendered.unwrap_or_else(|err| {
        tracing::debug!(target = "patchprobe.collector", error = %err, "failed to render array element");
        RenderedValue::Null
    })
}

fn render_scalar<C: JdwpClient + ?Sized>(
    client: &mut C,
    kind: &ValueKind,
) -> Result<RenderedValue, JdwpError> {
    Ok(match kind {
        ValueKind::Null => RenderedValue::Null,
        ValueKind::Void => RenderedValue::Text("<void value>".to_string()),
        ValueKind::Primitive(value) => render_primitive(value),
        ValueKind::String { object } => RenderedValue::Text(client.string_value(*object)?),
        ValueKind::Wrapper {
            object, type_id, ..
        } => {
            let field = client
                .visible_fields(*type_id)?
                .into_iter()
                .find(|field| field.name == "value" && !field.is_static())
                .ok_or_else(|| JdwpError::Protocol("boxed value has no `value` field".into()))?;
            let values = client.object_field_values(*object, &[field.id])?;
            values
                .first()
                .map(render_primitive)
                .unwrap_or(RenderedValue::Null)
        }
        ValueKind::Array { type_name, .. } | ValueKind::Object { type_name, .. } => {
            RenderedValue::Text(type_name.clone())
        }
    })
}

fn render_primitive(value: &JdwpValue) -> RenderedValue {
    match value {
        JdwpValue::Boolean(v) => RenderedValue::Boolean(*v),
        JdwpValue::Byte(v) => RenderedValue::Integer(i64::from(*v)),
        JdwpValue::Short(v) => RenderedValue::Integer(i64::from(*v)),
        JdwpValue::Int(v) => RenderedValue::Integer(i64::from(*v)),
        JdwpValue::Long(v) => RenderedValue::Integer(*v),
        JdwpValue::Float(v) => RenderedValue::Float(*v),
        JdwpValue::Double(v) => RenderedValue::Double(*v),
        JdwpValue::Char(v) => RenderedValue::Char(*v),
        JdwpValue::Void => RenderedValue::Text("<void value>".to_string()),
        JdwpValue::Null | JdwpValue::Object(_) => RenderedValue::Null,
    }
}

const ARRAY_CHUNK: usize = 64;

/// The first `limit` non-null elements of an array, fetched in chunks so
/// large arrays are not transferred whole.
pub(crate) fn non_null_elements<C: JdwpClient + ?Sized>(
    client: &mut C,
    array: ObjectId,
    limit: usize,
) -> Result<Vec<JdwpValue>, JdwpError> {
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }
    let length = client.array_length(array)?;
    let mut first = 0;
    while first < length && out.len() < limit {
        let chunk = ARRAY_CHUNK.min(length - first);
        for value in client.array_values(array, first, chunk)? {
            if value != JdwpValue::Null {
                out.push(value);
                if out.len() == limit {
                    break;
                }
            }
        }
        first += chunk;
    }
    Ok(out)
}
