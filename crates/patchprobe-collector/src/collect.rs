//! Runtime state capture for one suspended thread.

use std::collections::{HashMap, HashSet};

use patchprobe_config::CollectorConfig;
use patchprobe_jdwp::{
    signature_tag, FieldInfo, FrameInfo, JdwpClient, JdwpError, JdwpValue, Location, ThreadId,
    VariableInfo, VariableTable,
};

use crate::error::CollectError;
use crate::model::{FrameSnapshot, Nested, RuntimeValue, RuntimeValueKind};
use crate::render::{self, ValueKind};

/// Captures frames and values under the bounds of a [`CollectorConfig`].
#[derive(Debug, Clone)]
pub struct Collector {
    config: CollectorConfig,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// A root value (depth 0) with its nested expansion.
    pub fn capture_value<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        kind: RuntimeValueKind,
        name: Option<String>,
        type_name: String,
        value: &JdwpValue,
    ) -> RuntimeValue {
        self.build_value(
            client,
            kind,
            name,
            Some(type_name),
            value,
            0,
            self.config.execution_depth,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_value<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        kind: RuntimeValueKind,
        name: Option<String>,
        declared_type: Option<String>,
        value: &JdwpValue,
        depth: usize,
        budget: usize,
    ) -> RuntimeValue {
        let value_kind = render::classify(client, value).unwrap_or_else(|err| {
            tracing::debug!(target = "patchprobe.collector", error = %err, "failed to classify value");
            ValueKind::Null
        });
        let type_name = declared_type
            .or_else(|| value_kind.type_name())
            .unwrap_or_else(|| "null".to_string());
        let rendered = render::render(client, &value_kind, self.config.array_elements);

        let nested = match &value_kind {
            ValueKind::Array { .. } | ValueKind::Object { .. } if budget == 0 => {
                Some(Nested::NotExpanded)
            }
            ValueKind::Array { object, .. } => {
                Some(Nested::Elements(self.expand_array(client, *object, depth, budget)))
            }
            ValueKind::Object {
                object, type_id, ..
            } => Some(Nested::Fields(
                self.expand_object(client, *object, *type_id, depth, budget),
            )),
            _ => None,
        };

        RuntimeValue {
            kind,
            name,
            type_name,
            value: rendered,
            depth,
            nested,
        }
    }

    fn expand_array<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        array: u64,
        depth: usize,
        budget: usize,
    ) -> Vec<RuntimeValue> {
        let elements = match render::non_null_elements(client, array, self.config.array_elements) {
            Ok(elements) => elements,
            Err(err) => {
                tracing::debug!(target = "patchprobe.collector", array, error = %err, "failed to read array elements");
                return Vec::new();
            }
        };
        elements
            .iter()
            .map(|element| {
                self.build_value(
                    client,
                    RuntimeValueKind::ArrayElement,
                    None,
                    None,
                    element,
                    depth + 1,
                    budget - 1,
                )
            })
            .collect()
    }

    fn expand_object<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        object: u64,
        type_id: u64,
        depth: usize,
        budget: usize,
    ) -> Vec<RuntimeValue> {
        let fields = match client.visible_fields(type_id) {
            Ok(fields) => fields,
            Err(err) => {
                tracing::debug!(target = "patchprobe.collector", object, error = %err, "failed to list fields");
                return Vec::new();
            }
        };
        let values = match read_field_values(client, type_id, Some(object), &fields) {
            Ok(values) => values,
            Err(err) => {
                tracing::debug!(target = "patchprobe.collector", object, error = %err, "failed to read fields");
                return Vec::new();
            }
        };
        values
            .into_iter()
            .map(|(field, value)| {
                self.build_value(
                    client,
                    RuntimeValueKind::Field,
                    Some(field.name.clone()),
                    Some(field.type_name()),
                    &value,
                    depth + 1,
                    budget - 1,
                )
            })
            .collect()
    }

    /// Capture one stack frame: its visible locals, then (unless
    /// `skip_fields`) the fields of its declaring type.
    ///
    /// A frame whose method has no variable table fails with
    /// [`CollectError::MissingDebugInfo`]; the caller decides whether that
    /// ends the capture.
    pub fn capture_frame<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        thread: ThreadId,
        frame: &FrameInfo,
        index: usize,
        stack_trace: Vec<String>,
    ) -> Result<FrameSnapshot, CollectError> {
        let location = location_string(client, &frame.location)?;
        let variables = match visible_variables(client, &frame.location) {
            Ok(variables) => variables,
            Err(err) if err.is_absent_information() => {
                return Err(missing_debug_info(client, &frame.location));
            }
            Err(err) => return Err(err.into()),
        };

        let mut values = self.read_locals(client, thread, frame, &variables)?;
        if !self.config.skip_fields {
            values.extend(self.frame_fields(client, thread, frame)?);
        }

        Ok(FrameSnapshot {
            index,
            location,
            stack_trace,
            values,
        })
    }

    fn read_locals<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        thread: ThreadId,
        frame: &FrameInfo,
        variables: &[VariableInfo],
    ) -> Result<Vec<RuntimeValue>, JdwpError> {
        if variables.is_empty() {
            return Ok(Vec::new());
        }
        let slots: Vec<(u32, u8)> = variables
            .iter()
            .map(|variable| (variable.slot, signature_tag(&variable.signature)))
            .collect();
        let values = client.frame_values(thread, frame.id, &slots)?;
        Ok(variables
            .iter()
            .zip(values.iter())
            .map(|(variable, value)| {
                self.capture_value(
                    client,
                    RuntimeValueKind::LocalVariable,
                    Some(variable.name.clone()),
                    variable.type_name(),
                    value,
                )
            })
            .collect())
    }

    /// Visible fields of the frame's declaring type. Statics are read off the
    /// type; instance fields off `this`, and not at all in static methods.
    fn frame_fields<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        thread: ThreadId,
        frame: &FrameInfo,
    ) -> Result<Vec<RuntimeValue>, JdwpError> {
        let type_id = frame.location.class_id;
        let in_static_method = client
            .method_at(&frame.location)?
            .is_some_and(|method| method.is_static());
        let this = if in_static_method {
            None
        } else {
            client.this_object(thread, frame.id)?
        };

        let fields: Vec<FieldInfo> = client
            .visible_fields(type_id)?
            .into_iter()
            .filter(|field| field.is_static() || this.is_some())
            .collect();
        let values = read_field_values(client, type_id, this.map(|this| this.id), &fields)?;
        Ok(values
            .into_iter()
            .map(|(field, value)| {
                self.capture_value(
                    client,
                    RuntimeValueKind::Field,
                    Some(field.name.clone()),
                    field.type_name(),
                    &value,
                )
            })
            .collect())
    }

    /// Arguments of the method executing in `frame`: the visible variables
    /// whose slots fall within the argument words.
    pub fn capture_arguments<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        thread: ThreadId,
        frame: &FrameInfo,
    ) -> Result<Vec<RuntimeValue>, JdwpError> {
        let table = client.variable_table(frame.location.class_id, frame.location.method_id)?;
        let arguments: Vec<VariableInfo> = table
            .variables
            .iter()
            .filter(|variable| variable.slot < table.arg_count && !is_synthetic_this(&variable.name))
            .cloned()
            .collect();
        self.read_locals(client, thread, frame, &arguments)
    }

    /// `method:line, declaring.Type` for every frame of `thread` whose
    /// declaring type matches none of the configured exclusions.
    pub fn stack_trace<C: JdwpClient + ?Sized>(
        &self,
        client: &mut C,
        thread: ThreadId,
    ) -> Result<Vec<String>, JdwpError> {
        let count = client.frame_count(thread)?;
        let frames = client.frames(thread, 0, count)?;
        let mut trace = Vec::with_capacity(frames.len());
        for frame in frames {
            let type_name = client.type_name(frame.location.class_id)?;
            if self
                .config
                .stack_trace_exclusions
                .iter()
                .any(|excluded| type_name.contains(excluded.as_str()))
            {
                continue;
            }
            let method = client
                .method_at(&frame.location)?
                .map(|method| method.name)
                .unwrap_or_else(|| "<unknown>".to_string());
            let line = display_line(client.line_of(&frame.location)?);
            trace.push(format!("{method}:{line}, {type_name}"));
        }
        Ok(trace)
    }
}

/// `this` and the outer-instance references javac adds to inner classes.
fn is_synthetic_this(name: &str) -> bool {
    name == "this" || name.starts_with("this$")
}

/// Variables in scope at `location`, as a debugger would list them:
/// synthetic `this` references removed, and an inner-scope variable hiding
/// an outer one of the same name.
pub fn visible_variables<C: JdwpClient + ?Sized>(
    client: &mut C,
    location: &Location,
) -> Result<Vec<VariableInfo>, JdwpError> {
    let VariableTable { variables, .. } =
        client.variable_table(location.class_id, location.method_id)?;
    let in_scope: Vec<VariableInfo> = variables
        .into_iter()
        .filter(|variable| variable.is_visible_at(location.index) && !is_synthetic_this(&variable.name))
        .collect();

    let mut innermost: HashMap<&str, u64> = HashMap::new();
    for variable in &in_scope {
        let start = innermost.entry(variable.name.as_str()).or_insert(variable.code_index);
        *start = (*start).max(variable.code_index);
    }
    let keep: Vec<bool> = in_scope
        .iter()
        .map(|variable| innermost.get(variable.name.as_str()) == Some(&variable.code_index))
        .collect();

    let mut seen = HashSet::new();
    Ok(in_scope
        .iter()
        .zip(keep)
        .filter(|(variable, keep)| *keep && seen.insert(variable.name.clone()))
        .map(|(variable, _)| variable.clone())
        .collect())
}

/// `declaring.Type:line`, with `-1` when the line is unknown.
pub fn location_string<C: JdwpClient + ?Sized>(
    client: &mut C,
    location: &Location,
) -> Result<String, JdwpError> {
    let type_name = client.type_name(location.class_id)?;
    let line = display_line(client.line_of(location)?);
    Ok(format!("{type_name}:{line}"))
}

/// Source path of a type relative to its source root: package directories
/// plus the source file name (`foo/Bar.java`). Falls back to the outer type's
/// name when the class carries no `SourceFile` attribute.
pub fn source_path<C: JdwpClient + ?Sized>(
    client: &mut C,
    type_id: u64,
) -> Result<String, JdwpError> {
    let type_name = client.type_name(type_id)?;
    let (package, simple) = match type_name.rsplit_once('.') {
        Some((package, simple)) => (Some(package), simple),
        None => (None, type_name.as_str()),
    };
    let file = match client.source_file(type_id) {
        Ok(Some(file)) => file,
        Ok(None) => default_source_file(simple),
        Err(err) if err.is_absent_information() => default_source_file(simple),
        Err(err) => return Err(err),
    };
    Ok(match package {
        Some(package) => format!("{}/{file}", package.replace('.', "/")),
        None => file,
    })
}

fn default_source_file(simple_name: &str) -> String {
    let outer = simple_name.split('$').next().unwrap_or(simple_name);
    format!("{outer}.java")
}

fn display_line(line: Option<u32>) -> i64 {
    line.map_or(-1, i64::from)
}

fn missing_debug_info<C: JdwpClient + ?Sized>(client: &mut C, location: &Location) -> CollectError {
    let type_name = client
        .type_name(location.class_id)
        .unwrap_or_else(|_| format!("<type {}>", location.class_id));
    let method = client
        .method_at(location)
        .ok()
        .flatten()
        .map(|method| method.name)
        .unwrap_or_else(|| format!("<method {}>", location.method_id));
    CollectError::MissingDebugInfo { type_name, method }
}

/// Read `fields`, statics from `type_id` and instance fields from `object`,
/// keeping the field order. Instance fields are dropped when `object` is
/// `None`.
fn read_field_values<C: JdwpClient + ?Sized>(
    client: &mut C,
    type_id: u64,
    object: Option<u64>,
    fields: &[FieldInfo],
) -> Result<Vec<(FieldInfo, JdwpValue)>, JdwpError> {
    let static_ids: Vec<u64> = fields.iter().filter(|f| f.is_static()).map(|f| f.id).collect();
    let instance_ids: Vec<u64> = fields.iter().filter(|f| !f.is_static()).map(|f| f.id).collect();

    let statics = if static_ids.is_empty() {
        Vec::new()
    } else {
        client.static_field_values(type_id, &static_ids)?
    };
    let instances = match object {
        Some(object) if !instance_ids.is_empty() => {
            client.object_field_values(object, &instance_ids)?
        }
        _ => Vec::new(),
    };
    let mut statics = statics.into_iter();
    let mut instances = instances.into_iter();

    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let value = if field.is_static() {
            statics.next()
        } else if object.is_some() {
            instances.next()
        } else {
            continue;
        };
        if let Some(value) = value {
            out.push((field.clone(), value));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RenderedValue;
    use patchprobe_jdwp::{
        MockClass, MockFrame, MockJdwpClient, MockMethod, MockObject, ObjectRef, ObjectTag,
    };
    use pretty_assertions::assert_eq;

    const STATIC: u32 = 0x0008;

    fn var(name: &str, signature: &str, code_index: u64, length: u32, slot: u32) -> VariableInfo {
        VariableInfo {
            code_index,
            name: name.to_string(),
            signature: signature.to_string(),
            length,
            slot,
        }
    }

    fn location(class_id: u64, method_id: u64, index: u64) -> Location {
        Location {
            type_tag: 1,
            class_id,
            method_id,
            index,
        }
    }

    #[test]
    fn visible_variables_hide_outer_scopes_and_this() {
        let mut vm = MockJdwpClient::new();
        vm.add_class(
            1,
            MockClass::new("a.B").with_method(
                MockMethod::new(10, "run", "()V", 0).with_variables(VariableTable {
                    arg_count: 1,
                    variables: vec![
                        var("this", "La/B;", 0, 100, 0),
                        var("this$0", "La/Outer;", 0, 100, 1),
                        var("i", "I", 0, 100, 2),
                        var("later", "I", 50, 10, 3),
                        var("i", "J", 8, 20, 4),
                    ],
                }),
            ),
        );

        let names = |vars: Vec<VariableInfo>| -> Vec<(String, String)> {
            vars.into_iter().map(|v| (v.name, v.signature)).collect()
        };
        assert_eq!(
            names(visible_variables(&mut vm, &location(1, 10, 12)).unwrap()),
            vec![("i".to_string(), "J".to_string())]
        );
        assert_eq!(
            names(visible_variables(&mut vm, &location(1, 10, 52)).unwrap()),
            vec![
                ("i".to_string(), "I".to_string()),
                ("later".to_string(), "I".to_string())
            ]
        );
    }

    #[test]
    fn source_paths_follow_packages() {
        let mut vm = MockJdwpClient::new();
        vm.add_class(1, MockClass::new("foo.bar.Baz$Inner").with_source_file("Baz.java"))
            .add_class(2, MockClass::new("foo.Qux$1"))
            .add_class(3, MockClass::new("Top").with_source_file("Top.java"));
        assert_eq!(source_path(&mut vm, 1).unwrap(), "foo/bar/Baz.java");
        assert_eq!(source_path(&mut vm, 2).unwrap(), "foo/Qux.java");
        assert_eq!(source_path(&mut vm, 3).unwrap(), "Top.java");
    }

    fn linked_list_vm() -> MockJdwpClient {
        let mut vm = MockJdwpClient::new();
        vm.add_class(
            1,
            MockClass::new("a.Node")
                .with_field(1, "value", "I", 0)
                .with_field(2, "next", "La/Node;", 0)
                .with_field(3, "COUNT", "I", STATIC)
                .with_static_value(3, JdwpValue::Int(2)),
        );
        let node = |id: u64| JdwpValue::Object(ObjectRef { id, tag: ObjectTag::Object });
        vm.add_object(
            100,
            MockObject::Instance {
                type_id: 1,
                fields: HashMap::from([(1, JdwpValue::Int(1)), (2, node(101))]),
            },
        )
        // A cycle: 101.next points back to 100.
        .add_object(
            101,
            MockObject::Instance {
                type_id: 1,
                fields: HashMap::from([(1, JdwpValue::Int(2)), (2, node(100))]),
            },
        );
        vm
    }

    fn config(execution_depth: usize) -> CollectorConfig {
        CollectorConfig {
            execution_depth,
            ..CollectorConfig::default()
        }
    }

    #[test]
    fn depth_zero_is_not_expanded() {
        let mut vm = linked_list_vm();
        let collector = Collector::new(config(0));
        let head = JdwpValue::Object(ObjectRef { id: 100, tag: ObjectTag::Object });
        let value = collector.capture_value(
            &mut vm,
            RuntimeValueKind::LocalVariable,
            Some("head".into()),
            "a.Node".into(),
            &head,
        );
        assert_eq!(value.value, RenderedValue::Text("a.Node".into()));
        assert_eq!(value.nested, Some(Nested::NotExpanded));
    }

    #[test]
    fn cyclic_objects_stop_at_the_depth_budget() {
        let mut vm = linked_list_vm();
        for budget in 1..=4 {
            let collector = Collector::new(config(budget));
            let head = JdwpValue::Object(ObjectRef { id: 100, tag: ObjectTag::Object });
            let value = collector.capture_value(
                &mut vm,
                RuntimeValueKind::LocalVariable,
                Some("head".into()),
                "a.Node".into(),
                &head,
            );
            assert_eq!(value.max_depth(), budget);

            let Some(Nested::Fields(fields)) = &value.nested else {
                panic!("expected fields, got {:?}", value.nested);
            };
            let names: Vec<_> = fields.iter().map(|f| f.name.clone().unwrap()).collect();
            assert_eq!(names, vec!["value", "next", "COUNT"]);
            assert_eq!(fields[2].value, RenderedValue::Integer(2));
        }
    }

    #[test]
    fn frame_capture_reads_locals_then_fields() {
        let mut vm = linked_list_vm();
        vm.add_class(
            2,
            MockClass::new("a.Main")
                .with_field(10, "counter", "I", 0)
                .with_field(11, "LIMIT", "J", STATIC)
                .with_static_value(11, JdwpValue::Long(9))
                .with_method(
                    MockMethod::new(20, "step", "(I)V", 0)
                        .with_lines(&[5, 6, 7])
                        .with_variables(VariableTable {
                            arg_count: 2,
                            variables: vec![var("this", "La/Main;", 0, 12, 0), var("n", "I", 0, 12, 1)],
                        }),
                )
                .with_method(
                    MockMethod::new(21, "helper", "()V", STATIC)
                        .with_lines(&[9])
                        .with_variables(VariableTable::default()),
                ),
        )
        .add_object(
            200,
            MockObject::Instance {
                type_id: 2,
                fields: HashMap::from([(10, JdwpValue::Int(3))]),
            },
        );
        vm.set_stack(
            7,
            vec![
                MockFrame::new(location(2, 21, 0)),
                MockFrame::new(location(2, 20, 4))
                    .with_slot(1, JdwpValue::Int(41))
                    .with_this(ObjectRef { id: 200, tag: ObjectTag::Object }),
            ],
        );
        let collector = Collector::new(config(0));
        let frames = vm.frames(7, 0, 2).unwrap();

        let instance = collector.capture_frame(&mut vm, 7, &frames[1], 2, Vec::new()).unwrap();
        assert_eq!(instance.location, "a.Main:6");
        let summary: Vec<_> = instance
            .values
            .iter()
            .map(|v| (v.kind, v.name.clone().unwrap(), v.type_name.clone(), v.value.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    RuntimeValueKind::LocalVariable,
                    "n".to_string(),
                    "int".to_string(),
                    RenderedValue::Integer(41)
                ),
                (
                    RuntimeValueKind::Field,
                    "counter".to_string(),
                    "int".to_string(),
                    RenderedValue::Integer(3)
                ),
                (
                    RuntimeValueKind::Field,
                    "LIMIT".to_string(),
                    "long".to_string(),
                    RenderedValue::Integer(9)
                ),
            ]
        );

        let in_static = collector.capture_frame(&mut vm, 7, &frames[0], 1, Vec::new()).unwrap();
        let names: Vec<_> = in_static.values.iter().map(|v| v.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["LIMIT"]);

        let skip = Collector::new(CollectorConfig {
            skip_fields: true,
            ..config(0)
        });
        let locals_only = skip.capture_frame(&mut vm, 7, &frames[1], 2, Vec::new()).unwrap();
        assert_eq!(locals_only.values.len(), 1);

        let arguments = collector.capture_arguments(&mut vm, 7, &frames[1]).unwrap();
        assert_eq!(arguments.len(), 1);
        assert_eq!(arguments[0].name.as_deref(), Some("n"));
    }

    #[test]
    fn missing_variable_table_is_reported() {
        let mut vm = MockJdwpClient::new();
        vm.add_class(
            1,
            MockClass::new("a.NoDebug").with_method(MockMethod::new(5, "run", "()V", 0).with_lines(&[3])),
        );
        vm.set_stack(1, vec![MockFrame::new(location(1, 5, 0))]);
        let frames = vm.frames(1, 0, 1).unwrap();
        let err = Collector::new(config(0))
            .capture_frame(&mut vm, 1, &frames[0], 1, Vec::new())
            .unwrap_err();
        assert!(
            matches!(err, CollectError::MissingDebugInfo { ref type_name, ref method } if type_name == "a.NoDebug" && method == "run"),
            "{err:?}"
        );
    }

    #[test]
    fn stack_trace_drops_excluded_types() {
        let mut vm = MockJdwpClient::new();
        vm.add_class(1, MockClass::new("a.App").with_method(MockMethod::new(1, "work", "()V", 0).with_lines(&[10, 11])))
            .add_class(2, MockClass::new("org.junit.runners.Runner").with_method(MockMethod::new(2, "run", "()V", 0)))
            .add_class(3, MockClass::new("a.AppTest").with_method(MockMethod::new(3, "testWork", "()V", 0).with_lines(&[20])));
        vm.set_stack(
            4,
            vec![
                MockFrame::new(location(1, 1, 5)),
                MockFrame::new(location(3, 3, 0)),
                MockFrame::new(location(2, 2, 0)),
            ],
        );
        let trace = Collector::new(config(0)).stack_trace(&mut vm, 4).unwrap();
        assert_eq!(trace, vec!["work:11, a.App".to_string(), "testWork:20, a.AppTest".to_string()]);
    }
}
