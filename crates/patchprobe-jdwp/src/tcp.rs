use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::codec::{read_packet, IdSizes, JdwpReader, JdwpWriter, Packet, HANDSHAKE};
use crate::{
    event_kind, EventSet, FieldId, FieldInfo, FrameId, FrameInfo, JdwpClient,
    JdwpError, JdwpEvent, JdwpValue, LineEntry, Location, MethodId, MethodInfo, ObjectId,
    ObjectRef, ObjectTag, ReferenceTypeId, RequestId, ThreadId, VariableInfo, VariableTable,
    JDWP_HEADER_LEN, MAX_JDWP_PACKET_BYTES, SUSPEND_POLICY_ALL,
};

const MODIFIER_CLASS_ONLY: u8 = 4;
const MODIFIER_CLASS_MATCH: u8 = 5;
const MODIFIER_LOCATION_ONLY: u8 = 7;

#[derive(Clone, Debug)]
pub struct TcpJdwpClientConfig {
    /// Per-address connect timeout.
    pub connect_timeout: Duration,
    /// How long a command may wait for its reply.
    pub reply_timeout: Duration,
    /// How often [`JdwpClient::wait_for_events`] re-checks its cancellation
    /// token while the VM is quiet.
    pub poll_interval: Duration,
}

impl Default for TcpJdwpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            reply_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Blocking JDWP client over a TCP socket.
///
/// Replies are matched to commands by packet id. Event packets that arrive
/// while a command is waiting for its reply are queued and handed out by the
/// next [`JdwpClient::wait_for_events`] call.
pub struct TcpJdwpClient {
    stream: Option<TcpStream>,
    config: TcpJdwpClientConfig,
    next_packet_id: u32,
    id_sizes: IdSizes,
    pending_events: VecDeque<EventSet>,
    cache: Cache,
}

#[derive(Debug, Default)]
struct Cache {
    signatures: HashMap<ReferenceTypeId, String>,
    methods: HashMap<ReferenceTypeId, Vec<MethodInfo>>,
    fields: HashMap<ReferenceTypeId, Vec<FieldInfo>>,
    superclasses: HashMap<ReferenceTypeId, Option<ReferenceTypeId>>,
    line_tables: HashMap<(ReferenceTypeId, MethodId), Vec<LineEntry>>,
}

enum Readiness {
    Ready,
    Idle,
    Closed,
}

impl TcpJdwpClient {
    /// Connect to a JVM started with `-agentlib:jdwp=transport=dt_socket,server=y`.
    ///
    /// Every resolved address is tried in order; the first one that completes
    /// the handshake and answers `IDSizes` wins.
    pub fn connect(host: &str, port: u16, config: TcpJdwpClientConfig) -> Result<Self, JdwpError> {
        let addrs: BTreeSet<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid JDWP address").into());
        }

        let mut last_err: Option<JdwpError> = None;
        for addr in addrs {
            match Self::connect_addr(addr, config.clone()) {
                Ok(client) => {
                    tracing::debug!(target = "patchprobe.jdwp", %addr, "attached to debuggee");
                    return Ok(client);
                }
                Err(err) => {
                    tracing::debug!(target = "patchprobe.jdwp", %addr, error = %err, "attach attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(JdwpError::NotConnected))
    }

    fn connect_addr(addr: SocketAddr, config: TcpJdwpClientConfig) -> Result<Self, JdwpError> {
        let mut stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        stream.set_read_timeout(Some(config.reply_timeout))?;
        stream.set_write_timeout(Some(config.reply_timeout))?;
        stream.set_nodelay(true)?;

        stream.write_all(HANDSHAKE)?;
        stream.flush()?;
        let mut reply = [0u8; HANDSHAKE.len()];
        stream.read_exact(&mut reply)?;
        if reply != HANDSHAKE {
            return Err(JdwpError::HandshakeFailed);
        }

        let mut client = Self {
            stream: Some(stream),
            config,
            next_packet_id: 1,
            id_sizes: IdSizes::default(),
            pending_events: VecDeque::new(),
            cache: Cache::default(),
        };
        client.id_sizes = client.query_id_sizes()?;
        Ok(client)
    }

    pub fn id_sizes(&self) -> IdSizes {
        self.id_sizes
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, JdwpError> {
        self.stream.as_mut().ok_or(JdwpError::NotConnected)
    }

    fn writer(&self) -> JdwpWriter {
        JdwpWriter::new(self.id_sizes)
    }

    fn query_id_sizes(&mut self) -> Result<IdSizes, JdwpError> {
        let reply = self.send_command(1, 7, &[])?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        Ok(IdSizes {
            field_id: r.u32()? as usize,
            method_id: r.u32()? as usize,
            object_id: r.u32()? as usize,
            reference_type_id: r.u32()? as usize,
            frame_id: r.u32()? as usize,
        })
    }

    fn send_command(
        &mut self,
        command_set: u8,
        command: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, JdwpError> {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        let length = JDWP_HEADER_LEN + data.len();
        if length > MAX_JDWP_PACKET_BYTES {
            return Err(JdwpError::Protocol(format!(
                "packet too large ({length} bytes, max {MAX_JDWP_PACKET_BYTES})"
            )));
        }

        let result = self.exchange(id, command_set, command, data);
        if let Err(err) = &result {
            if err.is_disconnect() {
                self.stream = None;
            }
        }
        result
    }

    fn exchange(
        &mut self,
        id: u32,
        command_set: u8,
        command: u8,
        data: &[u8],
    ) -> Result<Vec<u8>, JdwpError> {
        {
            let stream = self.stream_mut()?;
            stream.write_all(&crate::codec::encode_command(id, command_set, command, data))?;
            stream.flush()?;
        }

        loop {
            let packet = read_packet(self.stream_mut()?)?;
            match packet {
                Packet::Reply {
                    id: reply_id,
                    error_code,
                    data,
                } => {
                    if reply_id != id {
                        return Err(JdwpError::Protocol(format!(
                            "unexpected reply id {reply_id}, expected {id}"
                        )));
                    }
                    if error_code != 0 {
                        return Err(JdwpError::CommandFailed { error_code });
                    }
                    return Ok(data);
                }
                Packet::Command {
                    command_set: 64,
                    command: 100,
                    data,
                    ..
                } => {
                    let events = parse_composite(&data, self.id_sizes)?;
                    self.pending_events.push_back(events);
                }
                Packet::Command {
                    command_set,
                    command,
                    ..
                } => {
                    tracing::debug!(
                        target = "patchprobe.jdwp",
                        command_set,
                        command,
                        "ignoring unexpected command packet from debuggee"
                    );
                }
            }
        }
    }

    /// Check whether a packet is waiting, sleeping at most one poll interval.
    fn poll_readable(&mut self) -> Result<Readiness, JdwpError> {
        let poll_interval = self.config.poll_interval;
        let reply_timeout = self.config.reply_timeout;
        let stream = self.stream_mut()?;
        stream.set_read_timeout(Some(poll_interval))?;
        let mut probe = [0u8; 1];
        let readiness = match stream.peek(&mut probe) {
            Ok(0) => Readiness::Closed,
            Ok(_) => Readiness::Ready,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Readiness::Idle
            }
            Err(err) => {
                let err = JdwpError::Io(err);
                if err.is_disconnect() {
                    Readiness::Closed
                } else {
                    return Err(err);
                }
            }
        };
        stream.set_read_timeout(Some(reply_timeout))?;
        Ok(readiness)
    }

    fn event_request(&mut self, kind: u8, modifier: JdwpWriter) -> Result<RequestId, JdwpError> {
        let mut body = self.writer();
        body.u8(kind).u8(SUSPEND_POLICY_ALL).u32(1);
        let mut body = body.into_vec();
        body.extend_from_slice(&modifier.into_vec());
        let reply = self.send_command(15, 1, &body)?;
        JdwpReader::new(&reply, self.id_sizes).u32()
    }

    fn tagged_values(&self, reply: &[u8]) -> Result<Vec<JdwpValue>, JdwpError> {
        let mut r = JdwpReader::new(reply, self.id_sizes);
        let count = r.count()?;
        (0..count).map(|_| r.tagged_value()).collect()
    }
}

impl JdwpClient for TcpJdwpClient {
    fn resume(&mut self) -> Result<(), JdwpError> {
        self.send_command(1, 9, &[])?;
        Ok(())
    }

    fn dispose(&mut self) -> Result<(), JdwpError> {
        let result = self.send_command(1, 6, &[]).map(|_| ());
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        result
    }

    fn classes_by_name(&mut self, class: &str) -> Result<Vec<ReferenceTypeId>, JdwpError> {
        let mut body = self.writer();
        body.string(&crate::class_name_to_signature(class));
        let reply = self.send_command(1, 2, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let count = r.count()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let _tag = r.u8()?;
            out.push(r.reference_type_id()?);
            let _status = r.i32()?;
        }
        Ok(out)
    }

    fn set_class_prepare_request(&mut self, class_pattern: &str) -> Result<RequestId, JdwpError> {
        let mut modifier = self.writer();
        modifier.u8(MODIFIER_CLASS_MATCH).string(class_pattern);
        self.event_request(event_kind::CLASS_PREPARE, modifier)
    }

    fn set_breakpoint_request(&mut self, location: Location) -> Result<RequestId, JdwpError> {
        let mut modifier = self.writer();
        modifier.u8(MODIFIER_LOCATION_ONLY).location(&location);
        self.event_request(event_kind::BREAKPOINT, modifier)
    }

    fn set_method_exit_request(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<RequestId, JdwpError> {
        let mut modifier = self.writer();
        modifier.u8(MODIFIER_CLASS_ONLY).reference_type_id(type_id);
        self.event_request(event_kind::METHOD_EXIT_WITH_RETURN_VALUE, modifier)
    }

    fn wait_for_events(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<EventSet>, JdwpError> {
        if let Some(events) = self.pending_events.pop_front() {
            return Ok(Some(events));
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if self.stream.is_none() {
                return Ok(None);
            }
            match self.poll_readable()? {
                Readiness::Idle => continue,
                Readiness::Closed => {
                    tracing::debug!(target = "patchprobe.jdwp", "debuggee closed the connection");
                    self.stream = None;
                    return Ok(None);
                }
                Readiness::Ready => {}
            }

            let packet = match read_packet(self.stream_mut()?) {
                Ok(packet) => packet,
                Err(err) if err.is_disconnect() => {
                    self.stream = None;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            match packet {
                Packet::Command {
                    command_set: 64,
                    command: 100,
                    data,
                    ..
                } => return parse_composite(&data, self.id_sizes).map(Some),
                Packet::Command {
                    command_set,
                    command,
                    ..
                } => {
                    tracing::debug!(
                        target = "patchprobe.jdwp",
                        command_set,
                        command,
                        "ignoring unexpected command packet from debuggee"
                    );
                }
                Packet::Reply { id, .. } => {
                    return Err(JdwpError::Protocol(format!(
                        "unsolicited reply packet {id} while waiting for events"
                    )));
                }
            }
        }
    }

    fn type_signature(&mut self, type_id: ReferenceTypeId) -> Result<String, JdwpError> {
        if let Some(sig) = self.cache.signatures.get(&type_id) {
            return Ok(sig.clone());
        }
        let mut body = self.writer();
        body.reference_type_id(type_id);
        let reply = self.send_command(2, 1, &body.into_vec())?;
        let sig = JdwpReader::new(&reply, self.id_sizes).string()?;
        self.cache.signatures.insert(type_id, sig.clone());
        Ok(sig)
    }

    fn source_file(&mut self, type_id: ReferenceTypeId) -> Result<Option<String>, JdwpError> {
        let mut body = self.writer();
        body.reference_type_id(type_id);
        match self.send_command(2, 7, &body.into_vec()) {
            Ok(reply) => Ok(Some(JdwpReader::new(&reply, self.id_sizes).string()?)),
            Err(err) if err.is_absent_information() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn superclass(
        &mut self,
        type_id: ReferenceTypeId,
    ) -> Result<Option<ReferenceTypeId>, JdwpError> {
        if let Some(superclass) = self.cache.superclasses.get(&type_id) {
            return Ok(*superclass);
        }
        let mut body = self.writer();
        body.reference_type_id(type_id);
        let reply = self.send_command(3, 1, &body.into_vec())?;
        let superclass = match JdwpReader::new(&reply, self.id_sizes).reference_type_id()? {
            0 => None,
            id => Some(id),
        };
        self.cache.superclasses.insert(type_id, superclass);
        Ok(superclass)
    }

    fn methods(&mut self, type_id: ReferenceTypeId) -> Result<Vec<MethodInfo>, JdwpError> {
        if let Some(methods) = self.cache.methods.get(&type_id) {
            return Ok(methods.clone());
        }
        let mut body = self.writer();
        body.reference_type_id(type_id);
        let reply = self.send_command(2, 5, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let count = r.count()?;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                id: r.method_id()?,
                name: r.string()?,
                signature: r.string()?,
                mod_bits: r.u32()?,
            });
        }
        self.cache.methods.insert(type_id, methods.clone());
        Ok(methods)
    }

    fn fields(&mut self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>, JdwpError> {
        if let Some(fields) = self.cache.fields.get(&type_id) {
            return Ok(fields.clone());
        }
        let mut body = self.writer();
        body.reference_type_id(type_id);
        let reply = self.send_command(2, 4, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let count = r.count()?;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                id: r.field_id()?,
                name: r.string()?,
                signature: r.string()?,
                mod_bits: r.u32()?,
            });
        }
        self.cache.fields.insert(type_id, fields.clone());
        Ok(fields)
    }

    fn line_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<LineEntry>, JdwpError> {
        if let Some(table) = self.cache.line_tables.get(&(type_id, method_id)) {
            return Ok(table.clone());
        }
        let mut body = self.writer();
        body.reference_type_id(type_id).method_id(method_id);
        let reply = self.send_command(6, 1, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let _start = r.u64()?;
        let _end = r.u64()?;
        let count = r.count()?;
        let mut table = Vec::with_capacity(count);
        for _ in 0..count {
            let code_index = r.u64()?;
            let line = r.i32()?;
            table.push(LineEntry {
                code_index,
                line: line.max(0) as u32,
            });
        }
        table.sort_by_key(|entry| entry.code_index);
        self.cache
            .line_tables
            .insert((type_id, method_id), table.clone());
        Ok(table)
    }

    fn variable_table(
        &mut self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<VariableTable, JdwpError> {
        let mut body = self.writer();
        body.reference_type_id(type_id).method_id(method_id);
        let reply = self.send_command(6, 2, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let arg_count = r.i32()?.max(0) as u32;
        let count = r.count()?;
        let mut variables = Vec::with_capacity(count);
        for _ in 0..count {
            variables.push(VariableInfo {
                code_index: r.u64()?,
                name: r.string()?,
                signature: r.string()?,
                length: r.u32()?,
                slot: r.u32()?,
            });
        }
        Ok(VariableTable {
            arg_count,
            variables,
        })
    }

    fn frame_count(&mut self, thread: ThreadId) -> Result<usize, JdwpError> {
        let mut body = self.writer();
        body.object_id(thread);
        let reply = self.send_command(11, 7, &body.into_vec())?;
        Ok(JdwpReader::new(&reply, self.id_sizes).i32()?.max(0) as usize)
    }

    fn frames(
        &mut self,
        thread: ThreadId,
        start: usize,
        length: usize,
    ) -> Result<Vec<FrameInfo>, JdwpError> {
        let mut body = self.writer();
        body.object_id(thread).u32(start as u32).u32(length as u32);
        let reply = self.send_command(11, 6, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let count = r.count()?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(FrameInfo {
                id: r.frame_id()?,
                location: r.location()?,
            });
        }
        Ok(frames)
    }

    fn frame_values(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
        slots: &[(u32, u8)],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let mut body = self.writer();
        body.object_id(thread).frame_id(frame).u32(slots.len() as u32);
        for (slot, tag) in slots {
            body.u32(*slot).u8(*tag);
        }
        let reply = self.send_command(16, 1, &body.into_vec())?;
        self.tagged_values(&reply)
    }

    fn this_object(
        &mut self,
        thread: ThreadId,
        frame: FrameId,
    ) -> Result<Option<ObjectRef>, JdwpError> {
        let mut body = self.writer();
        body.object_id(thread).frame_id(frame);
        let reply = self.send_command(16, 3, &body.into_vec())?;
        Ok(JdwpReader::new(&reply, self.id_sizes)
            .tagged_value()?
            .object())
    }

    fn object_type(&mut self, object: ObjectId) -> Result<ReferenceTypeId, JdwpError> {
        let mut body = self.writer();
        body.object_id(object);
        let reply = self.send_command(9, 1, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        let _tag = r.u8()?;
        r.reference_type_id()
    }

    fn object_field_values(
        &mut self,
        object: ObjectId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let mut body = self.writer();
        body.object_id(object).u32(fields.len() as u32);
        for field in fields {
            body.field_id(*field);
        }
        let reply = self.send_command(9, 2, &body.into_vec())?;
        self.tagged_values(&reply)
    }

    fn static_field_values(
        &mut self,
        type_id: ReferenceTypeId,
        fields: &[FieldId],
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        let mut body = self.writer();
        body.reference_type_id(type_id).u32(fields.len() as u32);
        for field in fields {
            body.field_id(*field);
        }
        let reply = self.send_command(2, 6, &body.into_vec())?;
        self.tagged_values(&reply)
    }

    fn string_value(&mut self, object: ObjectId) -> Result<String, JdwpError> {
        let mut body = self.writer();
        body.object_id(object);
        let reply = self.send_command(10, 1, &body.into_vec())?;
        JdwpReader::new(&reply, self.id_sizes).string()
    }

    fn array_length(&mut self, object: ObjectId) -> Result<usize, JdwpError> {
        let mut body = self.writer();
        body.object_id(object);
        let reply = self.send_command(13, 1, &body.into_vec())?;
        Ok(JdwpReader::new(&reply, self.id_sizes).i32()?.max(0) as usize)
    }

    fn array_values(
        &mut self,
        object: ObjectId,
        first: usize,
        length: usize,
    ) -> Result<Vec<JdwpValue>, JdwpError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let mut body = self.writer();
        body.object_id(object).u32(first as u32).u32(length as u32);
        let reply = self.send_command(13, 2, &body.into_vec())?;
        let mut r = JdwpReader::new(&reply, self.id_sizes);
        // ArrayRegion: primitive elements are untagged, object elements each
        // carry their own tag.
        let tag = r.u8()?;
        let count = r.count()?;
        let primitive = ObjectTag::from_tag(tag).is_none();
        (0..count)
            .map(|_| {
                if primitive {
                    r.untagged_value(tag)
                } else {
                    r.tagged_value()
                }
            })
            .collect()
    }
}

/// Decode an `Event.Composite` command body.
fn parse_composite(data: &[u8], sizes: IdSizes) -> Result<EventSet, JdwpError> {
    let mut r = JdwpReader::new(data, sizes);
    let suspend_policy = r.u8()?;
    let count = r.count()?;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = r.u8()?;
        let request_id = r.u32()?;
        let event = match kind {
            event_kind::VM_START => JdwpEvent::VmStart {
                thread: r.object_id()?,
            },
            event_kind::VM_DEATH => JdwpEvent::VmDeath,
            event_kind::CLASS_PREPARE => {
                let thread = r.object_id()?;
                let _tag = r.u8()?;
                let type_id = r.reference_type_id()?;
                let signature = r.string()?;
                let _status = r.i32()?;
                JdwpEvent::ClassPrepare {
                    request_id,
                    thread,
                    type_id,
                    signature,
                }
            }
            event_kind::BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.object_id()?,
                location: r.location()?,
            },
            event_kind::METHOD_EXIT => JdwpEvent::MethodExit {
                request_id,
                thread: r.object_id()?,
                location: r.location()?,
                return_value: None,
            },
            event_kind::METHOD_EXIT_WITH_RETURN_VALUE => JdwpEvent::MethodExit {
                request_id,
                thread: r.object_id()?,
                location: r.location()?,
                return_value: Some(r.tagged_value()?),
            },
            event_kind::SINGLE_STEP => {
                let _thread = r.object_id()?;
                let _location = r.location()?;
                JdwpEvent::Other { kind, request_id }
            }
            event_kind::THREAD_START | event_kind::THREAD_DEATH => {
                let _thread = r.object_id()?;
                JdwpEvent::Other { kind, request_id }
            }
            other => {
                // Payload length is unknown; the rest of the packet is unreadable.
                tracing::warn!(
                    target = "patchprobe.jdwp",
                    kind = other,
                    request_id,
                    skipped = count - events.len(),
                    "ignoring unknown event kind and the rest of the composite packet"
                );
                break;
            }
        };
        events.push(event);
    }
    Ok(EventSet {
        suspend_policy,
        events,
    })
}

impl std::fmt::Debug for TcpJdwpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpJdwpClient")
            .field("connected", &self.stream.is_some())
            .field("id_sizes", &self.id_sizes)
            .field("pending_events", &self.pending_events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_command, encode_reply};
    use crate::error_code;
    use pretty_assertions::assert_eq;
    use std::net::TcpListener;
    use std::thread;

    /// Minimal debuggee: answers the handshake and `IDSizes` itself and
    /// hands every other command to `handler`. Returning `None` hangs up.
    fn spawn_vm<F>(mut handler: F) -> (u16, thread::JoinHandle<()>)
    where
        F: FnMut(&mut TcpStream, u8, u8, &[u8]) -> Option<(u16, Vec<u8>)> + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut hs = [0u8; HANDSHAKE.len()];
            stream.read_exact(&mut hs).unwrap();
            assert_eq!(&hs, HANDSHAKE);
            stream.write_all(HANDSHAKE).unwrap();

            loop {
                let packet = match read_packet(&mut stream) {
                    Ok(packet) => packet,
                    Err(err) if err.is_disconnect() => break,
                    Err(err) => panic!("unexpected server read error: {err:?}"),
                };
                let Packet::Command {
                    id,
                    command_set,
                    command,
                    data,
                } = packet
                else {
                    panic!("unexpected reply packet from client");
                };
                let reply = if (command_set, command) == (1, 7) {
                    let mut body = Vec::new();
                    for _ in 0..5 {
                        body.extend_from_slice(&8u32.to_be_bytes());
                    }
                    Some((0, body))
                } else {
                    handler(&mut stream, command_set, command, &data)
                };
                match reply {
                    Some((error_code, body)) => {
                        stream
                            .write_all(&encode_reply(id, error_code, &body))
                            .unwrap();
                    }
                    None => break,
                }
            }
        });
        (port, server)
    }

    fn connect(port: u16) -> TcpJdwpClient {
        TcpJdwpClient::connect(
            "127.0.0.1",
            port,
            TcpJdwpClientConfig {
                poll_interval: Duration::from_millis(10),
                ..TcpJdwpClientConfig::default()
            },
        )
        .unwrap()
    }

    fn breakpoint_composite(thread: u64, location: Location) -> Vec<u8> {
        let mut w = JdwpWriter::new(IdSizes::default());
        w.u8(SUSPEND_POLICY_ALL)
            .u32(2)
            .u8(event_kind::THREAD_START)
            .u32(0)
            .object_id(thread)
            .u8(event_kind::BREAKPOINT)
            .u32(7)
            .object_id(thread)
            .location(&location);
        w.into_vec()
    }

    #[test]
    fn connect_negotiates_id_sizes_and_resolves_classes() {
        let (port, server) = spawn_vm(|_, set, cmd, data| match (set, cmd) {
            (1, 2) => {
                let sig = JdwpReader::new(data, IdSizes::default()).string().unwrap();
                assert_eq!(sig, "Lcom/example/Foo;");
                let mut w = JdwpWriter::new(IdSizes::default());
                w.u32(1).u8(1).reference_type_id(0x42).i32(7);
                Some((0, w.into_vec()))
            }
            _ => None,
        });

        let mut client = connect(port);
        assert_eq!(client.id_sizes(), IdSizes::default());
        assert_eq!(client.classes_by_name("com.example.Foo").unwrap(), vec![0x42]);
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn events_sent_before_a_reply_are_queued() {
        let location = Location {
            type_tag: 1,
            class_id: 3,
            method_id: 4,
            index: 12,
        };
        let (port, server) = spawn_vm(move |stream, set, cmd, _| match (set, cmd) {
            (1, 9) => {
                stream
                    .write_all(&encode_command(900, 64, 100, &breakpoint_composite(5, location)))
                    .unwrap();
                Some((0, Vec::new()))
            }
            _ => None,
        });

        let mut client = connect(port);
        client.resume().unwrap();
        let events = client
            .wait_for_events(&CancellationToken::new())
            .unwrap()
            .expect("queued event set");
        assert_eq!(events.suspend_policy, SUSPEND_POLICY_ALL);
        assert_eq!(
            events.events,
            vec![
                JdwpEvent::Other {
                    kind: event_kind::THREAD_START,
                    request_id: 0
                },
                JdwpEvent::Breakpoint {
                    request_id: 7,
                    thread: 5,
                    location
                }
            ]
        );
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn wait_for_events_returns_none_when_cancelled() {
        let (port, server) = spawn_vm(|_, _, _, _| None);
        let mut client = connect(port);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        assert!(client.wait_for_events(&cancel).unwrap().is_none());
        canceller.join().unwrap();
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn wait_for_events_returns_none_when_debuggee_exits() {
        let (port, server) = spawn_vm(|_, _, _, _| None);
        let mut client = connect(port);
        // Any command makes the fake VM hang up.
        assert!(client.resume().is_err());
        assert!(client
            .wait_for_events(&CancellationToken::new())
            .unwrap()
            .is_none());
        server.join().unwrap();
    }

    #[test]
    fn array_regions_decode_primitive_and_object_elements() {
        let (port, server) = spawn_vm(|_, set, cmd, data| match (set, cmd) {
            (13, 2) => {
                let array = JdwpReader::new(data, IdSizes::default()).object_id().unwrap();
                let mut w = JdwpWriter::new(IdSizes::default());
                if array == 1 {
                    w.u8(b'I').u32(2).i32(10).i32(20);
                } else {
                    w.u8(b'L')
                        .u32(2)
                        .u8(b's')
                        .object_id(77)
                        .u8(b'L')
                        .object_id(0);
                }
                Some((0, w.into_vec()))
            }
            _ => None,
        });

        let mut client = connect(port);
        assert_eq!(
            client.array_values(1, 0, 2).unwrap(),
            vec![JdwpValue::Int(10), JdwpValue::Int(20)]
        );
        assert_eq!(
            client.array_values(2, 0, 2).unwrap(),
            vec![
                JdwpValue::Object(ObjectRef {
                    id: 77,
                    tag: ObjectTag::String
                }),
                JdwpValue::Null
            ]
        );
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn command_errors_surface_as_command_failed() {
        let (port, server) = spawn_vm(|_, set, cmd, _| match (set, cmd) {
            (2, 7) => Some((error_code::ABSENT_INFORMATION, Vec::new())),
            (6, 2) => Some((error_code::ABSENT_INFORMATION, Vec::new())),
            _ => None,
        });

        let mut client = connect(port);
        assert_eq!(client.source_file(9).unwrap(), None);
        let err = client.variable_table(9, 1).unwrap_err();
        assert!(err.is_absent_information(), "{err:?}");
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn method_exit_event_carries_return_value() {
        let mut w = JdwpWriter::new(IdSizes::default());
        let location = Location {
            type_tag: 1,
            class_id: 1,
            method_id: 2,
            index: 0,
        };
        w.u8(SUSPEND_POLICY_ALL)
            .u32(1)
            .u8(event_kind::METHOD_EXIT_WITH_RETURN_VALUE)
            .u32(12)
            .object_id(99)
            .location(&location)
            .tagged_value(&JdwpValue::Int(123));

        let set = parse_composite(&w.into_vec(), IdSizes::default()).unwrap();
        assert_eq!(
            set.events,
            vec![JdwpEvent::MethodExit {
                request_id: 12,
                thread: 99,
                location,
                return_value: Some(JdwpValue::Int(123)),
            }]
        );
    }

    #[test]
    fn unknown_event_kind_ends_the_composite_packet() {
        let mut w = JdwpWriter::new(IdSizes::default());
        w.u8(SUSPEND_POLICY_ALL)
            .u32(3)
            .u8(event_kind::THREAD_START)
            .u32(4)
            .object_id(7)
            // MonitorContendedEnter, which is never requested.
            .u8(43)
            .u32(5)
            .object_id(7)
            .u8(event_kind::VM_DEATH)
            .u32(0);

        let set = parse_composite(&w.into_vec(), IdSizes::default()).unwrap();
        assert_eq!(set.suspend_policy, SUSPEND_POLICY_ALL);
        assert_eq!(
            set.events,
            vec![JdwpEvent::Other {
                kind: event_kind::THREAD_START,
                request_id: 4,
            }]
        );
    }
}
