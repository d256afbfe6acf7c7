use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio_util::sync::CancellationToken;

use crate::{
    class_name_to_signature, error_code, EventSet, FieldId, FieldInfo, FrameId, FrameInfo,
    JdwpClient, JdwpError, JdwpEvent, JdwpValue, LineEntry, Location, MethodId, MethodInfo,
    ObjectId, ObjectRef, ReferenceTypeId, RequestId, ThreadId, VariableTable,
};

const ERROR_INVALID_THREAD: u16 = 10;
const ERROR_INVALID_CLASS: u16 = 21;
const ERROR_INVALID_METHODID: u16 = 23;
const ERROR_INVALID_FIELDID: u16 = 25;
const ERROR_INVALID_FRAMEID: u16 = 30;

/// A loaded (or loadable) reference type.
#[derive(Clone, Debug, Default)]
pub struct MockClass {
    pub signature: String,
    pub source_file: Option<String>,
    pub superclass: Option<ReferenceTypeId>,
    pub methods: Vec<MockMethod>,
    pub fields: Vec<FieldInfo>,
    pub static_values: HashMap<FieldId, JdwpValue>,
    /// Whether `ClassesBySignature` already reports the type. Types that are
    /// not loaded become visible once a `ClassPrepare` event for them is
    /// delivered.
    pub loaded: bool,
}

impl MockClass {
    pub fn new(class_name: &str) -> Self {
        Self {
            signature: class_name_to_signature(class_name),
            loaded: true,
            ..Self::default()
        }
    }

    pub fn not_loaded(mut self) -> Self {
        self.loaded = false;
        self
    }

    pub fn with_source_file(mut self, file: &str) -> Self {
        self.source_file = Some(file.to_string());
        self
    }

    pub fn with_superclass(mut self, superclass: ReferenceTypeId) -> Self {
        self.superclass = Some(superclass);
        self
    }

    pub fn with_method(mut self, method: MockMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_field(mut self, id: FieldId, name: &str, signature: &str, mod_bits: u32) -> Self {
        self.fields.push(FieldInfo {
            id,
            name: name.to_string(),
            signature: signature.to_string(),
            mod_bits,
        });
        self
    }

    pub fn with_static_value(mut self, field: FieldId, value: JdwpValue) -> Self {
        self.static_values.insert(field, value);
        self
    }
}

#[derive(Clone, Debug)]
pub struct MockMethod {
    pub info: MethodInfo,
    /// `None` simulates a method without line information.
    pub line_table: Option<Vec<LineEntry>>,
    /// `None` simulates a class compiled without `-g:vars`.
    pub variables: Option<VariableTable>,
}

impl MockMethod {
    pub fn new(id: MethodId, name: &str, signature: &str, mod_bits: u32) -> Self {
        Self {
            info: MethodInfo {
                id,
                name: name.to_string(),
                signature: signature.to_string(),
                mod_bits,
            },
            line_table: None,
            variables: None,
        }
    }

    /// Line table where line `lines[i]` starts at code index `i * 4`.
    pub fn with_lines(mut self, lines: &[u32]) -> Self {
        self.line_table = Some(
            lines
                .iter()
                .enumerate()
                .map(|(i, line)| LineEntry {
                    code_index: i as u64 * 4,
                    line: *line,
                })
                .collect(),
        );
        self
    }

    pub fn with_variables(mut self, variables: VariableTable) -> Self {
        self.variables = Some(variables);
        self
    }
}

#[derive(Clone, Debug)]
pub enum MockObject {
    Instance {
        type_id: ReferenceTypeId,
        fields: HashMap<FieldId, JdwpValue>,
    },
    String(String),
    Array {
        type_id: ReferenceTypeId,
        elements: Vec<JdwpValue>,
    },
}

#[derive(Clone, Debug)]
pub struct MockFrame {
    pub location: Location,
    pub slots: HashMap<u32, JdwpValue>,
    pub this: Option<ObjectRef>,
}

impl MockFrame {
    pub fn new(location: Location) -> Self {
        Self {
            location,
            slots: HashMap::new(),
            this: None,
        }
    }

    pub fn with_slot(mut self, slot: u32, value: JdwpValue) -> Self {
        self.slots.insert(slot, value);
        self
    }

    pub fn with_this(mut self, this: ObjectRef) -> Self {
        self.this = Some(this);
        self
    }
}

/// Scripted stop: an event set plus the stacks threads have when it is
/// delivered.
#[derive(Clone, Debug)]
struct ScriptedStop {
    events: EventSet,
    stacks: Vec<(ThreadId, Vec<MockFrame>)>,
}

/// Deterministic in-memory VM used to exercise collectors without a JVM.
///
/// Event sets are delivered in the order they were queued; once the script
/// is exhausted, [`JdwpClient::wait_for_events`] behaves like a closed
/// connection. Every request the collector makes is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockJdwpClient {
    classes: BTreeMap<ReferenceTypeId, MockClass>,
    objects: HashMap<ObjectId, MockObject>,
    stacks: HashMap<ThreadId, Vec<MockFrame>>,
    script: VecDeque<ScriptedStop>,
    next_request_id: RequestId,

    pub class_prepare_requests: Vec<String>,
    pub breakpoint_requests: Vec<Location>,
    pub method_exit_requests: Vec<ReferenceTypeId>,
    pub resume_calls: usize,
    pub dispose_calls: usize,
}

impl MockJdwpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(&mut self, id: ReferenceTypeId, class: MockClass) -> &mut Self {
        self.classes.insert(id, class);
        self
    }

    pub fn add_object(&mut self, id: ObjectId, object: MockObject) -> &mut Self {
        self.objects.insert(id, object);
        self
    }

    pub fn set_stack(&mut self, thread: ThreadId, frames: Vec<MockFrame>) -> &mut Self {
        self.stacks.insert(thread, frames);
        self
    }

    pub fn push_events(&mut self, events: EventSet) -> &mut Self {
        self.script.push_back(ScriptedStop {
            events,
            stacks: Vec::new(),
        });
        self
    }

    /// Queue an event set; `thread`'s stack is replaced when it is delivered.
    pub fn push_stop(
        &mut self,
        events: EventSet,
        thread: ThreadId,
        frames: Vec<MockFrame>,
    ) -> &mut Self {
        self.script.push_back(ScriptedStop {
            events,
            stacks: vec![(thread, frames)],
        });
        self
    }

    pub fn remaining_events(&self) -> usize {
        self.script.len()
    }

    fn class(&self, type_id: ReferenceTypeId) -> Result<&MockClass, JdwpError> {
        self.classes
            .get(&type_id)
            .ok_or(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_CLASS,
            })
    }

    fn method(
        &self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<&MockMethod, JdwpError> {
        self.class(type_id)?
            .methods
            .iter()
            .find(|method| method.info.id == method_id)
            .ok_or(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_METHODID,
            })
    }

    fn object(&self, object: ObjectId) -> Result<&MockObject, JdwpError> {
        self.objects
            .get(&object)
            .ok_or(JdwpError::CommandFailed {
                error_code: error_code::INVALID_OBJECT,
            })
    }

    fn frame(&self, thread: ThreadId, frame: FrameId) -> Result<&MockFrame, JdwpError> {
        let stack = self.stacks.get(&thread).ok_or(JdwpError::CommandFailed {
            error_code: ERROR_INVALID_THREAD,
        })?;
        // Frame ids are 1-based positions in the thread's stack.
        frame
            .checked_sub(1)
            .and_then(|idx| stack.get(idx as usize))
            .ok_or(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_FRAMEID,
            })
    }

    fn next_request(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }
}

impl JdwpClient for MockJdwpClient {
    fn resume(&mut self) -> Result<(), JdwpError> {
        self.resume_calls += 1;
        Ok(())
    }

    fn dispose(&mut self) -> Result<(), JdwpError> {
        self.dispose_calls += 1;
        Ok(())
    }

    fn classes_by_name(&mut self, class: &str) -> Result<Vec<ReferenceTypeId>, JdwpError> {
        let signature = class_name_to_signature(class);
        Ok(self
            .classes
            .iter()
            .filter(|(_, c)| c.loaded && c.signature == signature)
            .map(|(id, _)| *id)
            .collect())
    }

    fn set_class_prepare_request(&mut self, class_pattern: &str) -> Result<RequestId, JdwpError> {
        self.class_prepare_requests.push(class_pattern.to_string());
        Ok(self.next_request())
    }

    fn set_breakpoint_request(&mut self, location: Location) -> Result<RequestId, JdwpError> {
        self.method(location.class_id, location.method_id)?;
        self.breakpoint_requests.push(location);
        Ok(self.next_request())
    }

    fn set_method_exit_request(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<RequestId, JdwpError> {
        self.class(type_id)?;
        self.method_exit_requests.push(type_id);
        Ok(self.next_request())
    }

    fn wait_for_events(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<EventSet>, JdwpError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let Some(stop) = self.script.pop_front() else {
            return Ok(None);
        };
        for (thread, frames) in stop.stacks {
            self.stacks.insert(thread, frames);
        }
        for event in &stop.events.events {
            if let JdwpEvent::ClassPrepare { type_id, .. } = event {
                if let Some(class) = self.classes.get_mut(type_id) {
                    class.loaded = true;
                }
            }
        }
        Ok(Some(stop.events))
    }

    fn type_signature(&mut self, type_id: ReferenceTypeId) -> Result<String, JdwpError> {
        Ok(self.class(type_id)?.signature.clone())
    }

    fn source_file(&mut self, type_id: ReferenceTypeId) -> Result<Option<String>, JdwpError> {
        Ok(self.class(type_id)?.source_file.clone())
    }

    fn superclass(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>, JdwpError> {
        Ok(self.class(type_id)?.superclass)
    }

    fn methods(&mut self, type_id: ReferenceTypeId) -> Result<Vec<MethodInfo>, JdwpError> {
        Ok(self
            .class(type_id)?
            .methods
            .iter()
            .map(|method| method.info.clone())
            .collect())
    }

    fn fields(&mut self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>, JdwpError> {
        Ok(self.class(type_id)?.fields.clone())
    }

    fn line_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<LineEntry>, JdwpError> {
        self.method(type_id, method_id)?
            .line_table
            .clone()
            .ok_or(JdwpError::CommandFailed {
                error_code: error_code::ABSENT_INFORMATION,
            })
    }

    fn variable_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<VariableTable, JdwpError> {
        self.method(type_id, method_id)?
            .variables
            .clone()
            .ok_or(JdwpError::CommandFailed {
                error_code: error_code::ABSENT_INFORMATION,
            })
    }

    fn frame_count(&mut self, thread: ThreadId) -> Result<usize, JdwpError> {
        self.stacks
            .get(&thread)
            .map(Vec::len)
            .ok_or(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_THREAD,
            })
    }

    fn frames(
        &mut self,
        thread: ThreadId,
        start: usize,
        length: usize,
    ) -> Result<Vec<FrameInfo>, JdwpError> {
        let stack = self.stacks.get(&thread).ok_or(JdwpError::CommandFailed {
            error_code: ERROR_INVALID_THREAD,
        })?;
        if start + length > stack.len() {
            return Err(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_FRAMEID,
            });
        }
        Ok(stack[start..start + length]
            .iter()
            .enumerate()
            .map(|(offset, frame)| FrameInfo {
                id: (start + offset + 1) as FrameId,
                location: frame.location,
            })
            .collect())
    }

    fn frame_values(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
        slots: &[(u32, u8)],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let frame = self.frame(thread, frame)?;
        slots
            .iter()
            .map(|(slot, _)| {
                frame
                    .slots
                    .get(slot)
                    .cloned()
                    .ok_or(JdwpError::CommandFailed {
                        error_code: error_code::INVALID_SLOT,
                    })
            })
            .collect()
    }

    fn this_object(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
    ) -> Result<Option<ObjectRef>, JdwpError> {
        Ok(self.frame(thread, frame)?.this)
    }

    fn object_type(&mut self, object: ObjectId) -> Result<ReferenceTypeId, JdwpError> {
        match self.object(object)? {
            MockObject::Instance { type_id, .. } | MockObject::Array { type_id, .. } => Ok(*type_id),
            MockObject::String(_) => self
                .classes
                .iter()
                .find(|(_, c)| c.signature == "Ljava/lang/String;")
                .map(|(id, _)| *id)
                .ok_or(JdwpError::CommandFailed {
                    error_code: ERROR_INVALID_CLASS,
                }),
        }
    }

    fn object_field_values(
        &mut self,
        object: ObjectId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let MockObject::Instance { fields: values, .. } = self.object(object)? else {
            return Err(JdwpError::CommandFailed {
                error_code: ERROR_INVALID_FIELDID,
            });
        };
        fields
            .iter()
            .map(|field| {
                values.get(field).cloned().ok_or(JdwpError::CommandFailed {
                    error_code: ERROR_INVALID_FIELDID,
                })
            })
            .collect()
    }

    fn static_field_values(
        &mut self,
        type_id: ReferenceTypeId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let class = self.class(type_id)?;
        fields
            .iter()
            .map(|field| {
                class
                    .static_values
                    .get(field)
                    .cloned()
                    .ok_or(JdwpError::CommandFailed {
                        error_code: ERROR_INVALID_FIELDID,
                    })
            })
            .collect()
    }

    fn string_value(&mut self, object: ObjectId) -> Result<String, JdwpError> {
        match self.object(object)? {
            MockObject::String(value) => Ok(value.clone()),
            _ => Err(JdwpError::CommandFailed {
                error_code: error_code::INVALID_OBJECT,
            }),
        }
    }

    fn array_length(&mut self, object: ObjectId) -> Result<usize, JdwpError> {
        match self.object(object)? {
            MockObject::Array { elements, .. } => Ok(elements.len()),
            _ => Err(JdwpError::CommandFailed {
                error_code: error_code::INVALID_OBJECT,
            }),
        }
    }

    fn array_values(
        &mut self,
        object: ObjectId,
        first: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        match self.object(object)? {
            MockObject::Array { elements, .. } => elements
                .get(first..first + length)
                .map(<[JdwpValue]>::to_vec)
                .ok_or(JdwpError::CommandFailed {
                    error_code: error_code::INVALID_OBJECT,
                }),
            _ => Err(JdwpError::CommandFailed {
                error_code: error_code::INVALID_OBJECT,
            }),
        }
    }
}
