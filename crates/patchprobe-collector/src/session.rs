use std::collections::BTreeSet;
use std::thread::JoinHandle;

use patchprobe_jdwp::{JdwpClient, ReferenceTypeId};
use patchprobe_process::ChildGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Launching,
    Attached,
    Running,
    Draining,
    Terminated,
}

/// A debuggee plus the JDWP connection to it.
///
/// Teardown (dispose the connection, kill and reap the child) happens exactly
/// once: from [`DebugSession::terminate`] or on drop.
pub struct DebugSession<C: JdwpClient> {
    client: C,
    child: Option<ChildGuard>,
    forwarders: Vec<JoinHandle<()>>,
    state: SessionState,
    /// Types whose breakpoints/exit requests have already been registered.
    handled_types: BTreeSet<ReferenceTypeId>,
}

impl<C: JdwpClient> DebugSession<C> {
    /// A session over an existing connection with no owned process.
    pub fn from_client(client: C) -> Self {
        Self {
            client,
            child: None,
            forwarders: Vec::new(),
            state: SessionState::Attached,
            handled_types: BTreeSet::new(),
        }
    }

    pub(crate) fn with_child(
        client: C,
        child: ChildGuard,
        forwarders: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            client,
            child: Some(child),
            forwarders,
            state: SessionState::Attached,
            handled_types: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state != SessionState::Terminated {
            tracing::trace!(target = "patchprobe.collector", from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub(crate) fn parts(&mut self) -> (&mut C, &mut BTreeSet<ReferenceTypeId>) {
        (&mut self.client, &mut self.handled_types)
    }

    /// Dispose the connection and stop the debuggee. Later calls do nothing.
    pub fn terminate(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Terminated;

        if let Err(err) = self.client.dispose() {
            // Expected when the VM already exited.
            tracing::debug!(target = "patchprobe.collector", error = %err, "dispose failed");
        }
        if let Some(mut child) = self.child.take() {
            match child.terminate() {
                Ok(Some(status)) => {
                    tracing::debug!(target = "patchprobe.collector", %status, "debuggee exited")
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(target = "patchprobe.collector", error = %err, "failed to stop debuggee")
                }
            }
        }
        // The forwarders end once the child's pipes close; they are not
        // joined so a stray grandchild holding a pipe cannot block teardown.
        self.forwarders.clear();
    }
}

impl<C: JdwpClient> Drop for DebugSession<C> {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl<C: JdwpClient + std::fmt::Debug> std::fmt::Debug for DebugSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("client", &self.client)
            .field("child", &self.child.as_ref().and_then(ChildGuard::id))
            .field("state", &self.state)
            .finish()
    }
}
