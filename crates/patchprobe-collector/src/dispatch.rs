//! Request registration and the debug event loop.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use patchprobe_jdwp::{
    CancellationToken, JdwpClient, JdwpError, JdwpEvent, JdwpValue, Location, ReferenceTypeId,
    ThreadId, SUSPEND_POLICY_NONE,
};

use crate::error::CollectError;
use crate::session::{DebugSession, SessionState};
use crate::spec::InstrumentationSpec;

/// Requests created for one or more loaded types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration {
    pub breakpoints: usize,
    /// Configured lines without an executable location.
    pub skipped_lines: usize,
    pub method_exits: usize,
}

impl Registration {
    fn merge(&mut self, other: Registration) {
        self.breakpoints += other.breakpoints;
        self.skipped_lines += other.skipped_lines;
        self.method_exits += other.method_exits;
    }
}

/// Why [`run_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    VmDeath,
    Disconnected,
    Cancelled,
}

/// Receives the events the collector records. Called with the VM suspended.
pub trait EventHandler<C: JdwpClient> {
    fn on_breakpoint(
        &mut self,
        client: &mut C,
        thread: ThreadId,
        location: Location,
    ) -> Result<(), CollectError>;

    fn on_method_exit(
        &mut self,
        client: &mut C,
        thread: ThreadId,
        location: Location,
        return_value: Option<JdwpValue>,
    ) -> Result<(), CollectError>;
}

/// Resumes the VM when dropped, so an event batch never leaves it suspended,
/// whichever way processing ends.
pub struct ResumeGuard<'a, C: JdwpClient> {
    client: &'a mut C,
    armed: bool,
}

impl<'a, C: JdwpClient> ResumeGuard<'a, C> {
    pub fn new(client: &'a mut C, armed: bool) -> Self {
        Self { client, armed }
    }

    /// Resume now and report the outcome.
    pub fn finish(mut self) -> Result<(), JdwpError> {
        if std::mem::replace(&mut self.armed, false) {
            self.client.resume()
        } else {
            Ok(())
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: JdwpClient> Deref for ResumeGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
    }
}

impl<C: JdwpClient> DerefMut for ResumeGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client
    }
}

impl<C: JdwpClient> Drop for ResumeGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.client.resume() {
                tracing::debug!(target = "patchprobe.collector", error = %err, "resume failed");
            }
        }
    }
}

/// One class-prepare request per watched type; types the VM has already
/// loaded are handled immediately.
pub fn register_watches<C: JdwpClient>(
    session: &mut DebugSession<C>,
    spec: &InstrumentationSpec,
) -> Result<Registration, JdwpError> {
    let mut total = Registration::default();
    for type_name in spec.watched_types() {
        session.client_mut().set_class_prepare_request(&type_name)?;
        tracing::info!(target = "patchprobe.collector", class = %type_name, "watching class");

        let loaded = session.client_mut().classes_by_name(&type_name)?;
        for type_id in loaded {
            total.merge(on_class_loaded(session, spec, type_id)?);
        }
    }
    Ok(total)
}

/// Register breakpoints and the method-exit request for a newly loaded type.
/// A type is handled at most once.
pub fn on_class_loaded<C: JdwpClient>(
    session: &mut DebugSession<C>,
    spec: &InstrumentationSpec,
    type_id: ReferenceTypeId,
) -> Result<Registration, JdwpError> {
    let (client, handled) = session.parts();
    register_type(client, handled, spec, type_id)
}

fn register_type<C: JdwpClient + ?Sized>(
    client: &mut C,
    handled: &mut BTreeSet<ReferenceTypeId>,
    spec: &InstrumentationSpec,
    type_id: ReferenceTypeId,
) -> Result<Registration, JdwpError> {
    let mut registration = Registration::default();
    if !handled.insert(type_id) {
        return Ok(registration);
    }
    let type_name = client.type_name(type_id)?;

    if let Some(lines) = spec.lines_for(&type_name) {
        for &line in lines {
            match client.location_of_line(type_id, line)? {
                Some(location) => {
                    client.set_breakpoint_request(location)?;
                    registration.breakpoints += 1;
                }
                None => {
                    tracing::warn!(
                        target = "patchprobe.collector",
                        "{line} is not a valid breakpoint in {type_name}"
                    );
                    registration.skipped_lines += 1;
                }
            }
        }
    }
    if spec.exit_watch.is_some() {
        client.set_method_exit_request(type_id)?;
        registration.method_exits += 1;
    }

    tracing::debug!(
        target = "patchprobe.collector",
        class = %type_name,
        breakpoints = registration.breakpoints,
        skipped = registration.skipped_lines,
        method_exits = registration.method_exits,
        "registered requests"
    );
    Ok(registration)
}

/// Process event batches until the VM dies, the connection drops or `cancel`
/// fires. Every event of a batch is handled before the VM is resumed, including
/// the batch that reports `VMDeath`.
pub fn run_loop<C, H>(
    session: &mut DebugSession<C>,
    spec: &InstrumentationSpec,
    handler: &mut H,
    cancel: &CancellationToken,
) -> Result<LoopExit, CollectError>
where
    C: JdwpClient,
    H: EventHandler<C>,
{
    session.set_state(SessionState::Running);
    let exit = loop {
        let batch = match session.client_mut().wait_for_events(cancel) {
            Ok(Some(batch)) => batch,
            Ok(None) if cancel.is_cancelled() => break LoopExit::Cancelled,
            Ok(None) => break LoopExit::Disconnected,
            Err(err) if err.is_disconnect() => break LoopExit::Disconnected,
            Err(err) => return Err(err.into()),
        };

        let (client, handled) = session.parts();
        let mut guard = ResumeGuard::new(client, batch.suspend_policy != SUSPEND_POLICY_NONE);
        let mut vm_died = false;
        for event in batch.events {
            let outcome = match event {
                JdwpEvent::VmDeath => {
                    vm_died = true;
                    Ok(())
                }
                JdwpEvent::ClassPrepare {
                    type_id, signature, ..
                } => {
                    tracing::debug!(target = "patchprobe.collector", %signature, "class prepared");
                    register_type(&mut *guard, handled, spec, type_id)
                        .map(|_| ())
                        .map_err(CollectError::from)
                }
                JdwpEvent::Breakpoint {
                    thread, location, ..
                } => handler.on_breakpoint(&mut *guard, thread, location),
                JdwpEvent::MethodExit {
                    thread,
                    location,
                    return_value,
                    ..
                } => handler.on_method_exit(&mut *guard, thread, location, return_value),
                JdwpEvent::VmStart { .. } | JdwpEvent::Other { .. } => Ok(()),
            };
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_disconnect() => {
                    tracing::info!(target = "patchprobe.collector", error = %err, "debuggee disconnected");
                    guard.disarm();
                    drop(guard);
                    session.set_state(SessionState::Draining);
                    return Ok(LoopExit::Disconnected);
                }
                Err(err) => return Err(err),
            }
        }

        if vm_died {
            guard.disarm();
            break LoopExit::VmDeath;
        }
        match guard.finish() {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => break LoopExit::Disconnected,
            Err(err) => return Err(err.into()),
        }
    };
    tracing::info!(target = "patchprobe.collector", ?exit, "event loop finished");
    session.set_state(SessionState::Draining);
    Ok(exit)
}
