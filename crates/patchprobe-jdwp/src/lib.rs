//! Java Debug Wire Protocol (JDWP) client for patchprobe.
//!
//! The collector drives a single debuggee JVM from one control thread, so the
//! client exposes a blocking, `&mut self` API. [`TcpJdwpClient`] speaks the
//! binary protocol over a socket; [`MockJdwpClient`] is a deterministic
//! in-memory VM used by the collector's tests.
//!
//! Only the commands needed to capture runtime state are implemented: class
//! lookup, event requests (class prepare, breakpoints, method exits), frame
//! and variable inspection, field reads, strings and arrays.

mod codec;
mod mock;
mod tcp;

use std::io;

use thiserror::Error;

pub use codec::{
    class_name_to_signature, encode_command, encode_reply, method_return_type_name, read_packet,
    signature_tag, signature_to_type_name, IdSizes, JdwpReader, JdwpWriter, Packet, HANDSHAKE,
};
pub use mock::{MockClass, MockFrame, MockJdwpClient, MockMethod, MockObject};
pub use tcp::{TcpJdwpClient, TcpJdwpClientConfig};
pub use tokio_util::sync::CancellationToken;

pub type ThreadId = u64;
pub type FrameId = u64;
pub type ObjectId = u64;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type RequestId = u32;

/// Length of the fixed JDWP packet header (length, id, flags, command/error).
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single packet. Anything larger is treated as a corrupt
/// length prefix rather than an allocation request.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;

pub fn validate_jdwp_packet_length(length: usize) -> Result<(), String> {
    if length < JDWP_HEADER_LEN {
        return Err(format!("invalid packet length {length}"));
    }
    if length > MAX_JDWP_PACKET_BYTES {
        return Err(format!(
            "JDWP packet length {length} exceeds maximum allowed ({MAX_JDWP_PACKET_BYTES} bytes); refusing to allocate"
        ));
    }
    Ok(())
}

/// JDWP error codes the collector reacts to.
pub mod error_code {
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_SLOT: u16 = 35;
    pub const ABSENT_INFORMATION: u16 = 101;
    pub const VM_DEAD: u16 = 112;
    pub const NATIVE_METHOD: u16 = 511;
}

/// `EventKind` constants.
pub mod event_kind {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const THREAD_START: u8 = 6;
    pub const THREAD_DEATH: u8 = 7;
    pub const CLASS_PREPARE: u8 = 8;
    pub const METHOD_EXIT: u8 = 41;
    pub const METHOD_EXIT_WITH_RETURN_VALUE: u8 = 42;
    pub const VM_START: u8 = 90;
    pub const VM_DEATH: u8 = 99;
}

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

const MODIFIER_STATIC: u32 = 0x0008;

/// Object-like value tags. Resolved once from the wire tag byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectTag {
    String,
    Array,
    Object,
    Thread,
    ThreadGroup,
    ClassLoader,
    ClassObject,
}

impl ObjectTag {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            b's' => Self::String,
            b'[' => Self::Array,
            b'L' => Self::Object,
            b't' => Self::Thread,
            b'g' => Self::ThreadGroup,
            b'l' => Self::ClassLoader,
            b'c' => Self::ClassObject,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::String => b's',
            Self::Array => b'[',
            Self::Object => b'L',
            Self::Thread => b't',
            Self::ThreadGroup => b'g',
            Self::ClassLoader => b'l',
            Self::ClassObject => b'c',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub tag: ObjectTag,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JdwpValue {
    Null,
    Void,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Object(ObjectRef),
}

impl JdwpValue {
    pub fn object(&self) -> Option<ObjectRef> {
        match self {
            Self::Object(obj) => Some(*obj),
            _ => None,
        }
    }

    /// Java name of a primitive value's type (`None` for references and null).
    pub fn primitive_type_name(&self) -> Option<&'static str> {
        Some(match self {
            Self::Void => "void",
            Self::Boolean(_) => "boolean",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Char(_) => "char",
            Self::Null | Self::Object(_) => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.mod_bits & MODIFIER_STATIC != 0
    }

    pub fn return_type_name(&self) -> String {
        method_return_type_name(&self.signature)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.mod_bits & MODIFIER_STATIC != 0
    }

    pub fn type_name(&self) -> String {
        signature_to_type_name(&self.signature)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEntry {
    pub code_index: u64,
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    /// Whether the variable is in scope at `index` within its method.
    pub fn is_visible_at(&self, index: u64) -> bool {
        self.code_index <= index && index < self.code_index + u64::from(self.length)
    }

    pub fn type_name(&self) -> String {
        signature_to_type_name(&self.signature)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VariableTable {
    /// Number of frame words used by arguments (`this` included for instance
    /// methods). Slots below this value hold arguments.
    pub arg_count: u32,
    pub variables: Vec<VariableInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JdwpEvent {
    VmStart {
        thread: ThreadId,
    },
    VmDeath,
    ClassPrepare {
        request_id: RequestId,
        thread: ThreadId,
        type_id: ReferenceTypeId,
        signature: String,
    },
    Breakpoint {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
        /// `None` for plain `METHOD_EXIT` events, which carry no value.
        return_value: Option<JdwpValue>,
    },
    /// Thread lifecycle and step events; parsed so a composite packet can be
    /// walked, but otherwise ignored.
    Other {
        kind: u8,
        request_id: RequestId,
    },
}

/// One `Event.Composite` packet: every event the VM reported at one
/// suspension point.
#[derive(Clone, Debug, PartialEq)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("JDWP client is not connected")]
    NotConnected,
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("JDWP command failed with error code {error_code}")]
    CommandFailed { error_code: u16 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("JDWP handshake failed")]
    HandshakeFailed,
    #[error("JDWP string was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid object id {0}")]
    InvalidObjectId(ObjectId),
    #[error("{0}")]
    Other(String),
}

impl JdwpError {
    /// The debuggee went away (socket closed/reset or VM reported dead).
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::CommandFailed { error_code } => *error_code == error_code::VM_DEAD,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// The class was compiled without the requested debug attribute (`-g`).
    pub fn is_absent_information(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { error_code } if *error_code == error_code::ABSENT_INFORMATION
        )
    }
}

/// Blocking JDWP operations used by the collector.
///
/// The network implementation and the mock implement the primitive commands;
/// the provided methods compose them the way JDI does (`visibleFields`,
/// `locationsOfLine`, ...).
pub trait JdwpClient: Send {
    /// `VirtualMachine.Resume`.
    fn resume(&mut self) -> Result<(), JdwpError>;

    /// `VirtualMachine.Dispose`: drops all requests and detaches.
    fn dispose(&mut self) -> Result<(), JdwpError>;

    /// `VirtualMachine.ClassesBySignature` for a binary class name.
    fn classes_by_name(&mut self, class: &str) -> Result<Vec<ReferenceTypeId>, JdwpError>;

    /// Suspend-all `CLASS_PREPARE` request filtered with `ClassMatch`.
    fn set_class_prepare_request(&mut self, class_pattern: &str) -> Result<RequestId, JdwpError>;

    /// Suspend-all `BREAKPOINT` request at an exact location.
    fn set_breakpoint_request(&mut self, location: Location) -> Result<RequestId, JdwpError>;

    /// Suspend-all `METHOD_EXIT_WITH_RETURN_VALUE` request restricted to
    /// `type_id` (and its subclasses) via `ClassOnly`.
    fn set_method_exit_request(&mut self, type_id: ReferenceTypeId)
        -> Result<RequestId, JdwpError>;

    /// Block until the VM reports the next composite event.
    ///
    /// Returns `Ok(None)` when the connection is gone or `cancel` fired while
    /// waiting. Neither case is an error for the caller's event loop.
    fn wait_for_events(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<EventSet>, JdwpError>;

    fn type_signature(&mut self, type_id: ReferenceTypeId) -> Result<String, JdwpError>;

    fn source_file(&mut self, type_id: ReferenceTypeId) -> Result<Option<String>, JdwpError>;

    fn superclass(&mut self, type_id: ReferenceTypeId)
        -> Result<Option<ReferenceTypeId>, JdwpError>;

    fn methods(&mut self, type_id: ReferenceTypeId) -> Result<Vec<MethodInfo>, JdwpError>;

    /// Fields declared directly by `type_id`.
    fn fields(&mut self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>, JdwpError>;

    fn line_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<LineEntry>, JdwpError>;

    fn variable_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<VariableTable, JdwpError>;

    fn frame_count(&mut self, thread: ThreadId) -> Result<usize, JdwpError>;

    fn frames(
        &mut self,
        thread: ThreadId,
        start: usize,
        length: usize,
    ) -> Result<Vec<FrameInfo>, JdwpError>;

    /// `StackFrame.GetValues` for `(slot, signature tag)` pairs.
    fn frame_values(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
        slots: &[(u32, u8)],
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    /// `StackFrame.ThisObject`; `None` in static and native methods.
    fn this_object(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
    ) -> Result<Option<ObjectRef>, JdwpError>;

    /// Runtime type of an object.
    fn object_type(&mut self, object: ObjectId) -> Result<ReferenceTypeId, JdwpError>;

    fn object_field_values(
        &mut self,
        object: ObjectId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    fn static_field_values(
        &mut self,
        type_id: ReferenceTypeId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    fn string_value(&mut self, object: ObjectId) -> Result<String, JdwpError>;

    fn array_length(&mut self, object: ObjectId) -> Result<usize, JdwpError>;

    fn array_values(
        &mut self,
        object: ObjectId,
        first: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError>;

    /// Java source-level name of a reference type (`int[]`, `foo.Bar$Baz`).
    fn type_name(&mut self, type_id: ReferenceTypeId) -> Result<String, JdwpError> {
        Ok(signature_to_type_name(&self.type_signature(type_id)?))
    }

    /// Fields visible from `type_id`: its own fields first, then those of each
    /// superclass that are not hidden by a field of the same name.
    fn visible_fields(&mut self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>, JdwpError> {
        let mut visible: Vec<FieldInfo> = Vec::new();
        let mut current = Some(type_id);
        // Class hierarchies are acyclic, but a broken VM must not hang us.
        let mut hops = 0usize;
        while let Some(ty) = current {
            for field in self.fields(ty)? {
                if !visible.iter().any(|seen| seen.name == field.name) {
                    visible.push(field);
                }
            }
            hops += 1;
            if hops > 256 {
                break;
            }
            current = self.superclass(ty)?;
        }
        Ok(visible)
    }

    /// Method metadata for a location, if the method belongs to the type.
    fn method_at(&mut self, location: &Location) -> Result<Option<MethodInfo>, JdwpError> {
        Ok(self
            .methods(location.class_id)?
            .into_iter()
            .find(|method| method.id == location.method_id))
    }

    /// Source line of a location (`None` when the method has no line table).
    fn line_of(&mut self, location: &Location) -> Result<Option<u32>, JdwpError> {
        let table = match self.line_table(location.class_id, location.method_id) {
            Ok(table) => table,
            Err(err)
                if err.is_absent_information()
                    || matches!(err, JdwpError::CommandFailed { error_code } if error_code == error_code::NATIVE_METHOD) =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };
        Ok(line_for_index(&table, location.index))
    }

    /// First executable location on `line`, the equivalent of JDI's
    /// `locationsOfLine(line).get(0)`.
    ///
    /// Methods without line information (abstract, native, or compiled
    /// without `-g:lines`) are skipped.
    fn location_of_line(
        &mut self,
        type_id: ReferenceTypeId,
        line: u32,
    ) -> Result<Option<Location>, JdwpError> {
        for method in self.methods(type_id)? {
            let table = match self.line_table(type_id, method.id) {
                Ok(table) => table,
                Err(JdwpError::CommandFailed { .. }) => continue,
                Err(err) => return Err(err),
            };
            let best = table
                .iter()
                .filter(|entry| entry.line == line)
                .map(|entry| entry.code_index)
                .min();
            if let Some(index) = best {
                return Ok(Some(Location {
                    type_tag: 1,
                    class_id: type_id,
                    method_id: method.id,
                    index,
                }));
            }
        }
        Ok(None)
    }
}

/// Entries are sorted by code index. Choose the last entry with
/// `code_index <= index`.
pub fn line_for_index(table: &[LineEntry], index: u64) -> Option<u32> {
    table
        .iter()
        .filter(|entry| entry.code_index <= index)
        .max_by_key(|entry| entry.code_index)
        .map(|entry| entry.line)
        .or_else(|| table.first().map(|entry| entry.line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_for_index_picks_last_entry_at_or_before_index() {
        let table = [
            LineEntry {
                code_index: 0,
                line: 10,
            },
            LineEntry {
                code_index: 4,
                line: 11,
            },
            LineEntry {
                code_index: 9,
                line: 13,
            },
        ];
        assert_eq!(line_for_index(&table, 0), Some(10));
        assert_eq!(line_for_index(&table, 5), Some(11));
        assert_eq!(line_for_index(&table, 100), Some(13));
        assert_eq!(line_for_index(&[], 3), None);
    }

    #[test]
    fn packet_length_validation() {
        assert!(validate_jdwp_packet_length(JDWP_HEADER_LEN).is_ok());
        assert_eq!(
            validate_jdwp_packet_length(3).unwrap_err(),
            "invalid packet length 3"
        );
        assert!(validate_jdwp_packet_length(MAX_JDWP_PACKET_BYTES + 1).is_err());
    }

    #[test]
    fn disconnect_classification() {
        let eof = JdwpError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_disconnect());
        assert!(JdwpError::CommandFailed {
            error_code: error_code::VM_DEAD
        }
        .is_disconnect());
        assert!(!JdwpError::Protocol("bad".into()).is_disconnect());
        assert!(JdwpError::CommandFailed {
            error_code: error_code::ABSENT_INFORMATION
        }
        .is_absent_information());
    }
}
