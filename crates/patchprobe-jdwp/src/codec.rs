//! Byte-level encoding shared by the socket client and the in-process fake
//! VMs used in tests.

use std::io::Read;

use crate::{
    validate_jdwp_packet_length, JdwpError, JdwpValue, Location, ObjectRef, ObjectTag,
    JDWP_HEADER_LEN,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const FLAG_REPLY: u8 = 0x80;

/// Sizes of the variable-width identifiers, as reported by
/// `VirtualMachine.IDSizes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for IdSizes {
    fn default() -> Self {
        // HotSpot uses 8-byte ids everywhere; the real values are queried after
        // the handshake.
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Debug)]
pub enum Packet {
    Reply {
        id: u32,
        error_code: u16,
        data: Vec<u8>,
    },
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        data: Vec<u8>,
    },
}

/// Read one packet. The length prefix is validated before the body is
/// allocated.
pub fn read_packet(reader: &mut impl Read) -> Result<Packet, JdwpError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let length = u32::from_be_bytes(len_buf) as usize;
    validate_jdwp_packet_length(length).map_err(JdwpError::Protocol)?;

    // id (u32), flags (u8), then error code or command set + command.
    let mut header = [0u8; 7];
    reader.read_exact(&mut header)?;
    let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let flags = header[4];

    let payload_len = length - JDWP_HEADER_LEN;
    let mut data = Vec::new();
    data.try_reserve_exact(payload_len).map_err(|_| {
        JdwpError::Protocol(format!(
            "unable to allocate packet buffer ({payload_len} bytes)"
        ))
    })?;
    data.resize(payload_len, 0);
    reader.read_exact(&mut data)?;

    if flags & FLAG_REPLY != 0 {
        Ok(Packet::Reply {
            id,
            error_code: u16::from_be_bytes([header[5], header[6]]),
            data,
        })
    } else {
        Ok(Packet::Command {
            id,
            command_set: header[5],
            command: header[6],
            data,
        })
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(JDWP_HEADER_LEN + payload.len());
    out.extend_from_slice(&((JDWP_HEADER_LEN + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0);
    out.push(command_set);
    out.push(command);
    out.extend_from_slice(payload);
    out
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(JDWP_HEADER_LEN + payload.len());
    out.extend_from_slice(&((JDWP_HEADER_LEN + payload.len()) as u32).to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(FLAG_REPLY);
    out.extend_from_slice(&error_code.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Builder for command (and, in tests, reply) bodies.
#[derive(Debug, Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
    sizes: IdSizes,
}

impl JdwpWriter {
    pub fn new(sizes: IdSizes) -> Self {
        Self {
            buf: Vec::new(),
            sizes,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Length-prefixed (u32) UTF-8 string.
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    fn id(&mut self, id: u64, size: usize) -> &mut Self {
        let be = id.to_be_bytes();
        self.buf.extend_from_slice(&be[8 - size.min(8)..]);
        self
    }

    pub fn object_id(&mut self, id: u64) -> &mut Self {
        self.id(id, self.sizes.object_id)
    }

    pub fn reference_type_id(&mut self, id: u64) -> &mut Self {
        self.id(id, self.sizes.reference_type_id)
    }

    pub fn method_id(&mut self, id: u64) -> &mut Self {
        self.id(id, self.sizes.method_id)
    }

    pub fn field_id(&mut self, id: u64) -> &mut Self {
        self.id(id, self.sizes.field_id)
    }

    pub fn frame_id(&mut self, id: u64) -> &mut Self {
        self.id(id, self.sizes.frame_id)
    }

    pub fn location(&mut self, loc: &Location) -> &mut Self {
        self.u8(loc.type_tag)
            .reference_type_id(loc.class_id)
            .method_id(loc.method_id)
            .u64(loc.index)
    }

    /// Value preceded by its signature tag byte.
    pub fn tagged_value(&mut self, value: &JdwpValue) -> &mut Self {
        match value {
            JdwpValue::Null => self.u8(b'L').object_id(0),
            JdwpValue::Void => self.u8(b'V'),
            JdwpValue::Boolean(v) => self.u8(b'Z').u8(u8::from(*v)),
            JdwpValue::Byte(v) => self.u8(b'B').u8(*v as u8),
            JdwpValue::Short(v) => self.u8(b'S').u16(*v as u16),
            JdwpValue::Int(v) => self.u8(b'I').i32(*v),
            JdwpValue::Long(v) => self.u8(b'J').u64(*v as u64),
            JdwpValue::Float(v) => self.u8(b'F').u32(v.to_bits()),
            JdwpValue::Double(v) => self.u8(b'D').u64(v.to_bits()),
            JdwpValue::Char(v) => self.u8(b'C').u16(*v as u32 as u16),
            JdwpValue::Object(obj) => self.u8(obj.tag.tag()).object_id(obj.id),
        }
    }
}

/// Cursor over a reply or event body.
pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
    sizes: IdSizes,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8], sizes: IdSizes) -> Self {
        Self { buf, pos: 0, sizes }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], JdwpError> {
        let bytes = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], JdwpError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                JdwpError::Protocol(format!(
                    "unexpected end of packet: need {len} bytes at {}, have {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, JdwpError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool, JdwpError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, JdwpError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn u32(&mut self) -> Result<u32, JdwpError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn i32(&mut self) -> Result<i32, JdwpError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn u64(&mut self) -> Result<u64, JdwpError> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    pub fn i64(&mut self) -> Result<i64, JdwpError> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    /// A u32 count used to size a `Vec`. Bounded by the bytes left in the
    /// packet so a corrupt count cannot trigger a huge allocation.
    pub fn count(&mut self) -> Result<usize, JdwpError> {
        let count = self.u32()? as usize;
        if count > self.remaining() {
            return Err(JdwpError::Protocol(format!(
                "element count {count} exceeds remaining packet bytes ({})",
                self.remaining()
            )));
        }
        Ok(count)
    }

    pub fn string(&mut self) -> Result<String, JdwpError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn id(&mut self, size: usize) -> Result<u64, JdwpError> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let bytes = self.bytes(size)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn object_id(&mut self) -> Result<u64, JdwpError> {
        self.id(self.sizes.object_id)
    }

    pub fn reference_type_id(&mut self) -> Result<u64, JdwpError> {
        self.id(self.sizes.reference_type_id)
    }

    pub fn method_id(&mut self) -> Result<u64, JdwpError> {
        self.id(self.sizes.method_id)
    }

    pub fn field_id(&mut self) -> Result<u64, JdwpError> {
        self.id(self.sizes.field_id)
    }

    pub fn frame_id(&mut self) -> Result<u64, JdwpError> {
        self.id(self.sizes.frame_id)
    }

    pub fn location(&mut self) -> Result<Location, JdwpError> {
        Ok(Location {
            type_tag: self.u8()?,
            class_id: self.reference_type_id()?,
            method_id: self.method_id()?,
            index: self.u64()?,
        })
    }

    /// Value whose tag is known out of band (primitive array regions,
    /// `StackFrame.GetValues` uses tagged values instead).
    pub fn untagged_value(&mut self, tag: u8) -> Result<JdwpValue, JdwpError> {
        Ok(match tag {
            b'Z' => JdwpValue::Boolean(self.bool()?),
            b'B' => JdwpValue::Byte(self.u8()? as i8),
            b'C' => {
                let unit = u32::from(self.u16()?);
                JdwpValue::Char(char::from_u32(unit).unwrap_or('\u{FFFD}'))
            }
            b'S' => JdwpValue::Short(self.u16()? as i16),
            b'I' => JdwpValue::Int(self.i32()?),
            b'J' => JdwpValue::Long(self.i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.u64()?)),
            b'V' => JdwpValue::Void,
            other => {
                let tag = ObjectTag::from_tag(other).ok_or_else(|| {
                    JdwpError::Protocol(format!("unknown value tag {other:#04x}"))
                })?;
                match self.object_id()? {
                    0 => JdwpValue::Null,
                    id => JdwpValue::Object(ObjectRef { id, tag }),
                }
            }
        })
    }

    pub fn tagged_value(&mut self) -> Result<JdwpValue, JdwpError> {
        let tag = self.u8()?;
        self.untagged_value(tag)
    }
}

/// `com.example.Foo` to `Lcom/example/Foo;`. Signatures pass through.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('[') || (class.starts_with('L') && class.ends_with(';')) {
        return class.to_string();
    }
    format!("L{};", class.replace('.', "/"))
}

/// JNI signature to Java source form: `[[I` becomes `int[][]`,
/// `Lfoo/Bar$Baz;` becomes `foo.Bar$Baz`.
pub fn signature_to_type_name(signature: &str) -> String {
    let dims = signature.bytes().take_while(|b| *b == b'[').count();
    let element = &signature[dims..];

    let mut out = match element.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        Some(class) => class.replace('/', "."),
        None => match element.as_bytes().first() {
            Some(b'B') => "byte".to_string(),
            Some(b'C') => "char".to_string(),
            Some(b'D') => "double".to_string(),
            Some(b'F') => "float".to_string(),
            Some(b'I') => "int".to_string(),
            Some(b'J') => "long".to_string(),
            Some(b'S') => "short".to_string(),
            Some(b'Z') => "boolean".to_string(),
            Some(b'V') => "void".to_string(),
            _ => "<unknown>".to_string(),
        },
    };
    for _ in 0..dims {
        out.push_str("[]");
    }
    out
}

/// Return type of a method signature such as `(ILjava/lang/String;)[J`.
pub fn method_return_type_name(signature: &str) -> String {
    match signature.rfind(')') {
        Some(idx) => signature_to_type_name(&signature[idx + 1..]),
        None => "<unknown>".to_string(),
    }
}

/// Tag byte for `StackFrame.GetValues`: the first character of the
/// variable's signature.
pub fn signature_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}
