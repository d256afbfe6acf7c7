use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex};

use patchprobe_collector::{
    collect, write_results, CollectError, DebugSession, InstrumentationSpec, MethodWatch, Nested,
    RenderedValue, RuntimeValue, RuntimeValueKind,
};
use patchprobe_config::CollectorConfig;
use patchprobe_jdwp::{
    CancellationToken, EventSet, JdwpEvent, JdwpValue, Location, MockClass, MockFrame,
    MockJdwpClient, MockMethod, MockObject, ObjectRef, ObjectTag, VariableInfo, VariableTable,
    SUSPEND_POLICY_ALL,
};
use pretty_assertions::assert_eq;
use tracing_subscriber::layer::SubscriberExt;

const STATIC: u32 = 0x0008;
const THREAD: u64 = 1;

fn var(name: &str, signature: &str, code_index: u64, length: u32, slot: u32) -> VariableInfo {
    VariableInfo {
        code_index,
        name: name.to_string(),
        signature: signature.to_string(),
        length,
        slot,
    }
}

fn loc(class_id: u64, method_id: u64, index: u64) -> Location {
    Location {
        type_tag: 1,
        class_id,
        method_id,
        index,
    }
}

fn object(id: u64) -> JdwpValue {
    JdwpValue::Object(ObjectRef {
        id,
        tag: ObjectTag::Object,
    })
}

fn batch(events: Vec<JdwpEvent>) -> EventSet {
    EventSet {
        suspend_policy: SUSPEND_POLICY_ALL,
        events,
    }
}

/// `calc.Calculator` (not yet loaded) called from `calc.CalculatorTest`,
/// itself called from JUnit.
fn calculator_vm() -> MockJdwpClient {
    let mut vm = MockJdwpClient::new();
    vm.add_class(
        1,
        MockClass::new("calc.Calculator")
            .not_loaded()
            .with_source_file("Calculator.java")
            .with_field(1, "history", "[I", 0)
            .with_field(2, "OPS", "I", STATIC)
            .with_static_value(2, JdwpValue::Int(4))
            .with_method(
                MockMethod::new(10, "add", "(II)I", 0)
                    .with_lines(&[5, 6, 7])
                    .with_variables(VariableTable {
                        arg_count: 3,
                        variables: vec![
                            var("this", "Lcalc/Calculator;", 0, 12, 0),
                            var("a", "I", 0, 12, 1),
                            var("b", "I", 0, 12, 2),
                            var("sum", "I", 4, 8, 3),
                        ],
                    }),
            )
            .with_method(
                MockMethod::new(11, "reset", "()V", 0)
                    .with_lines(&[10])
                    .with_variables(VariableTable {
                        arg_count: 1,
                        variables: vec![var("this", "Lcalc/Calculator;", 0, 4, 0)],
                    }),
            ),
    )
    .add_class(
        2,
        MockClass::new("calc.CalculatorTest")
            .with_source_file("CalculatorTest.java")
            .with_method(
                MockMethod::new(20, "testAdd", "()V", 0)
                    .with_lines(&[15, 16])
                    .with_variables(VariableTable {
                        arg_count: 1,
                        variables: vec![
                            var("this", "Lcalc/CalculatorTest;", 0, 8, 0),
                            var("calc", "Lcalc/Calculator;", 0, 8, 1),
                        ],
                    }),
            ),
    )
    .add_class(3, MockClass::new("[I"))
    .add_class(
        5,
        MockClass::new("org.junit.runner.JUnitCore").with_method(MockMethod::new(
            30,
            "run",
            "()V",
            0,
        )),
    )
    .add_object(
        100,
        MockObject::Instance {
            type_id: 1,
            fields: HashMap::from([(
                1,
                JdwpValue::Object(ObjectRef {
                    id: 101,
                    tag: ObjectTag::Array,
                }),
            )]),
        },
    )
    .add_object(
        101,
        MockObject::Array {
            type_id: 3,
            elements: (1..=5).map(JdwpValue::Int).collect(),
        },
    )
    .add_object(
        102,
        MockObject::Instance {
            type_id: 2,
            fields: HashMap::new(),
        },
    );
    vm
}

fn caller_frames() -> Vec<MockFrame> {
    vec![
        MockFrame::new(loc(2, 20, 4))
            .with_slot(1, object(100))
            .with_this(ObjectRef {
                id: 102,
                tag: ObjectTag::Object,
            }),
        MockFrame::new(loc(5, 30, 0)),
    ]
}

fn add_frame(index: u64) -> MockFrame {
    MockFrame::new(loc(1, 10, index))
        .with_slot(1, JdwpValue::Int(2))
        .with_slot(2, JdwpValue::Int(3))
        .with_slot(3, JdwpValue::Int(5))
        .with_this(ObjectRef {
            id: 100,
            tag: ObjectTag::Object,
        })
}

fn script(vm: &mut MockJdwpClient) {
    let mut at_breakpoint = vec![add_frame(4)];
    at_breakpoint.extend(caller_frames());
    let mut at_exit = vec![add_frame(8)];
    at_exit.extend(caller_frames());
    let mut in_reset = vec![MockFrame::new(loc(1, 11, 0)).with_this(ObjectRef {
        id: 100,
        tag: ObjectTag::Object,
    })];
    in_reset.extend(caller_frames());

    vm.push_events(batch(vec![JdwpEvent::ClassPrepare {
        request_id: 1,
        thread: THREAD,
        type_id: 1,
        signature: "Lcalc/Calculator;".into(),
    }]))
    .push_stop(
        batch(vec![JdwpEvent::Breakpoint {
            request_id: 2,
            thread: THREAD,
            location: loc(1, 10, 4),
        }]),
        THREAD,
        at_breakpoint,
    )
    .push_stop(
        batch(vec![JdwpEvent::MethodExit {
            request_id: 3,
            thread: THREAD,
            location: loc(1, 10, 8),
            return_value: Some(JdwpValue::Int(5)),
        }]),
        THREAD,
        at_exit,
    )
    .push_stop(
        batch(vec![JdwpEvent::MethodExit {
            request_id: 3,
            thread: THREAD,
            location: loc(1, 11, 0),
            return_value: Some(JdwpValue::Void),
        }]),
        THREAD,
        in_reset,
    )
    .push_events(batch(vec![JdwpEvent::VmDeath]));
}

fn spec(breakpoints: Option<&[u32]>) -> InstrumentationSpec {
    InstrumentationSpec {
        breakpoints: breakpoints.map(|lines| {
            let mut map = BTreeMap::new();
            map.insert("calc.Calculator".to_string(), lines.iter().copied().collect());
            map
        }),
        exit_watch: Some(MethodWatch {
            name: "add".into(),
            class_name: "calc.Calculator".into(),
        }),
    }
}

fn config() -> CollectorConfig {
    CollectorConfig {
        stack_trace_depth: 5,
        execution_depth: 1,
        array_elements: 3,
        ..CollectorConfig::default()
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with collector warnings written to a buffer, returning both.
fn with_warnings<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("patchprobe.collector=warn"))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(move || writer.clone())
                .with_ansi(false),
        );
    let out = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    (out, text)
}

/// Load `calc.Calculator`, stop once in `add` at line 6 on `stack`, then die.
fn single_hit(vm: &mut MockJdwpClient, stack: Vec<MockFrame>) {
    vm.push_events(batch(vec![JdwpEvent::ClassPrepare {
        request_id: 1,
        thread: THREAD,
        type_id: 1,
        signature: "Lcalc/Calculator;".into(),
    }]))
    .push_stop(
        batch(vec![JdwpEvent::Breakpoint {
            request_id: 2,
            thread: THREAD,
            location: loc(1, 10, 4),
        }]),
        THREAD,
        stack,
    )
    .push_events(batch(vec![JdwpEvent::VmDeath]));
}

fn breakpoints_only(lines: &[u32]) -> InstrumentationSpec {
    InstrumentationSpec {
        exit_watch: None,
        ..spec(Some(lines))
    }
}

fn summary(values: &[RuntimeValue]) -> Vec<(RuntimeValueKind, Option<String>, String, RenderedValue)> {
    values
        .iter()
        .map(|v| (v.kind, v.name.clone(), v.type_name.clone(), v.value.clone()))
        .collect()
}

fn ints(values: &[i64]) -> RenderedValue {
    RenderedValue::Sequence(values.iter().copied().map(RenderedValue::Integer).collect())
}

#[test]
fn records_breakpoints_and_qualifying_method_exits() {
    let mut vm = calculator_vm();
    script(&mut vm);
    let mut session = DebugSession::from_client(vm);
    let spec = spec(Some(&[6, 99]));

    let results = collect(&mut session, &spec, &config(), &CancellationToken::new()).unwrap();

    let client = session.client();
    assert_eq!(client.class_prepare_requests, vec!["calc.Calculator".to_string()]);
    assert_eq!(client.breakpoint_requests, vec![loc(1, 10, 4)]);
    assert_eq!(client.method_exit_requests, vec![1]);
    // Initial resume plus one per batch before VMDeath.
    assert_eq!(client.resume_calls, 5);

    assert_eq!(results.breakpoint_hits.len(), 1);
    let hit = &results.breakpoint_hits[0];
    assert_eq!(hit.file, "calc/Calculator.java");
    assert_eq!(hit.line, 6);
    // Depth 5 requested, 3 frames exist, and the JUnit frame has no debug info.
    assert_eq!(hit.frames.len(), 2);

    let top = &hit.frames[0];
    assert_eq!(top.index, 1);
    assert_eq!(top.location, "calc.Calculator:6");
    assert_eq!(
        top.stack_trace,
        vec![
            "add:6, calc.Calculator".to_string(),
            "testAdd:16, calc.CalculatorTest".to_string()
        ]
    );
    assert_eq!(
        summary(&top.values),
        vec![
            (RuntimeValueKind::LocalVariable, Some("a".to_string()), "int".to_string(), RenderedValue::Integer(2)),
            (RuntimeValueKind::LocalVariable, Some("b".to_string()), "int".to_string(), RenderedValue::Integer(3)),
            (RuntimeValueKind::LocalVariable, Some("sum".to_string()), "int".to_string(), RenderedValue::Integer(5)),
            (RuntimeValueKind::Field, Some("history".to_string()), "int[]".to_string(), ints(&[1, 2, 3])),
            (RuntimeValueKind::Field, Some("OPS".to_string()), "int".to_string(), RenderedValue::Integer(4)),
        ]
    );
    let Some(Nested::Elements(elements)) = &top.values[3].nested else {
        panic!("history should be expanded: {:?}", top.values[3].nested);
    };
    assert_eq!(
        summary(elements),
        (1..=3)
            .map(|i| (RuntimeValueKind::ArrayElement, None, "int".to_string(), RenderedValue::Integer(i)))
            .collect::<Vec<_>>()
    );

    let caller = &hit.frames[1];
    assert_eq!(caller.index, 2);
    assert_eq!(caller.location, "calc.CalculatorTest:16");
    assert_eq!(caller.values.len(), 1);
    let calc = &caller.values[0];
    assert_eq!(calc.value, RenderedValue::Text("calc.Calculator".into()));
    let Some(Nested::Fields(fields)) = &calc.nested else {
        panic!("calc should be expanded: {:?}", calc.nested);
    };
    assert_eq!(fields[0].name.as_deref(), Some("history"));
    assert_eq!(fields[0].depth, 1);
    assert_eq!(fields[0].nested, Some(Nested::NotExpanded));
    for frame in &hit.frames {
        for value in &frame.values {
            assert!(value.max_depth() <= 1, "{value:?}");
        }
    }

    // `reset` exits on line 10, which is neither instrumented nor watched.
    assert_eq!(results.method_exits.len(), 1);
    let exit = &results.method_exits[0];
    assert_eq!(exit.method_name, "add");
    assert_eq!(exit.return_type, "int");
    assert_eq!(exit.location, "calc.Calculator:7");
    assert_eq!(exit.return_value.value, RenderedValue::Integer(5));
    assert_eq!(exit.return_value.kind, RuntimeValueKind::ReturnValue);
    assert_eq!(
        summary(&exit.arguments),
        vec![
            (RuntimeValueKind::LocalVariable, Some("a".to_string()), "int".to_string(), RenderedValue::Integer(2)),
            (RuntimeValueKind::LocalVariable, Some("b".to_string()), "int".to_string(), RenderedValue::Integer(3)),
        ]
    );
    assert_eq!(
        exit.stack_trace,
        vec![
            "add:7, calc.Calculator".to_string(),
            "testAdd:16, calc.CalculatorTest".to_string()
        ]
    );

    let dir = tempfile::tempdir().unwrap();
    let paths = write_results(dir.path(), &results).unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(paths.method_exits).unwrap()).unwrap();
    assert_eq!(written[0]["methodName"], "add");
    assert_eq!(written[0]["returnValue"]["value"], 5);
}

#[test]
fn breakpoints_are_ignored_without_a_breakpoint_spec() {
    let mut vm = calculator_vm();
    script(&mut vm);
    // Breakpoint events can still arrive (e.g. requests left over by another
    // debugger); they are not recorded.
    let mut session = DebugSession::from_client(vm);
    let results = collect(&mut session, &spec(None), &config(), &CancellationToken::new()).unwrap();

    assert!(session.client().breakpoint_requests.is_empty());
    assert!(results.breakpoint_hits.is_empty());
    assert_eq!(results.method_exits.len(), 1);
}

#[test]
fn instrumented_type_without_lines_records_every_exit() {
    let mut vm = calculator_vm();
    script(&mut vm);
    let mut session = DebugSession::from_client(vm);
    let mut spec = spec(Some(&[]));
    spec.exit_watch = Some(MethodWatch {
        name: "unrelated".into(),
        class_name: "calc.Calculator".into(),
    });

    let results = collect(&mut session, &spec, &config(), &CancellationToken::new()).unwrap();
    let names: Vec<_> = results
        .method_exits
        .iter()
        .map(|exit| (exit.method_name.clone(), exit.return_value.value.clone()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("add".to_string(), RenderedValue::Integer(5)),
            ("reset".to_string(), RenderedValue::Text("<void value>".to_string())),
        ]
    );
}

#[test]
fn missing_debug_info_in_the_hit_frame_is_fatal() {
    let mut vm = MockJdwpClient::new();
    vm.add_class(
        1,
        MockClass::new("calc.Stripped")
            .with_method(MockMethod::new(10, "run", "()V", 0).with_lines(&[3, 4])),
    );
    vm.push_stop(
        batch(vec![JdwpEvent::Breakpoint {
            request_id: 1,
            thread: THREAD,
            location: loc(1, 10, 4),
        }]),
        THREAD,
        vec![MockFrame::new(loc(1, 10, 4))],
    );
    let mut session = DebugSession::from_client(vm);
    let mut map = BTreeMap::new();
    map.insert("calc.Stripped".to_string(), [4].into_iter().collect());
    let spec = InstrumentationSpec {
        breakpoints: Some(map),
        exit_watch: None,
    };

    let err = collect(&mut session, &spec, &config(), &CancellationToken::new()).unwrap_err();
    assert!(
        matches!(err, CollectError::MissingDebugInfo { ref type_name, .. } if type_name == "calc.Stripped"),
        "{err:?}"
    );
    assert!(err.to_string().contains("-g"), "{err}");
    // The failing batch still resumed the VM.
    assert_eq!(session.client().resume_calls, 2);
    session.terminate();
    assert_eq!(session.client().dispose_calls, 1);
}

#[test]
fn depth_beyond_the_stack_is_clamped_to_its_height() {
    let mut vm = calculator_vm();
    // `add` called straight from `testAdd`; both frames carry debug info.
    let mut stack = vec![add_frame(4)];
    stack.extend(caller_frames().into_iter().take(1));
    single_hit(&mut vm, stack);
    let mut session = DebugSession::from_client(vm);
    let config = CollectorConfig {
        stack_trace_depth: 5,
        ..config()
    };

    let (results, logs) = with_warnings(|| {
        collect(&mut session, &breakpoints_only(&[6]), &config, &CancellationToken::new())
    });
    let results = results.unwrap();

    assert_eq!(results.breakpoint_hits.len(), 1);
    let hit = &results.breakpoint_hits[0];
    assert_eq!(
        hit.frames.iter().map(|f| (f.index, f.location.clone())).collect::<Vec<_>>(),
        vec![
            (1, "calc.Calculator:6".to_string()),
            (2, "calc.CalculatorTest:16".to_string()),
        ]
    );
    assert!(
        logs.contains("Stack trace depth cannot be larger than actual. Processing 2 frames instead."),
        "{logs}"
    );
    assert!(!logs.contains("no debug information"), "{logs}");
}

#[test]
fn unresolvable_lines_do_not_block_the_rest_of_the_type() {
    let mut vm = calculator_vm();
    let mut stack = vec![add_frame(4)];
    stack.extend(caller_frames());
    single_hit(&mut vm, stack);
    let mut session = DebugSession::from_client(vm);

    // Line 2 is the class header and 99 is past the end of the file.
    let (results, logs) = with_warnings(|| {
        collect(&mut session, &breakpoints_only(&[2, 6, 99]), &config(), &CancellationToken::new())
    });
    let results = results.unwrap();

    assert_eq!(session.client().breakpoint_requests, vec![loc(1, 10, 4)]);
    assert!(logs.contains("2 is not a valid breakpoint in calc.Calculator"), "{logs}");
    assert!(logs.contains("99 is not a valid breakpoint in calc.Calculator"), "{logs}");
    assert_eq!(
        results
            .breakpoint_hits
            .iter()
            .map(|hit| (hit.file.clone(), hit.line))
            .collect::<Vec<_>>(),
        vec![("calc/Calculator.java".to_string(), 6)]
    );
    assert!(results.method_exits.is_empty());
}
