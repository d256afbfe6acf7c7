//! Turns breakpoint and method-exit events into records.

use patchprobe_config::{CollectorConfig, PatchprobeConfig};
use patchprobe_jdwp::{CancellationToken, JdwpClient, JdwpValue, Location, ThreadId};

use crate::collect::{location_string, source_path, Collector};
use crate::dispatch::{self, EventHandler};
use crate::error::CollectError;
use crate::launch::{self, LaunchRequest};
use crate::model::{BreakpointHit, CollectionResults, MethodExitRecord, RuntimeValueKind};
use crate::session::DebugSession;
use crate::spec::InstrumentationSpec;

/// Event handler that accumulates [`CollectionResults`].
pub struct Orchestrator<'a> {
    spec: &'a InstrumentationSpec,
    collector: Collector,
    results: CollectionResults,
}

impl<'a> Orchestrator<'a> {
    pub fn new(spec: &'a InstrumentationSpec, config: CollectorConfig) -> Self {
        Self {
            spec,
            collector: Collector::new(config),
            results: CollectionResults::default(),
        }
    }

    pub fn results(&self) -> &CollectionResults {
        &self.results
    }

    pub fn into_results(self) -> CollectionResults {
        self.results
    }

    fn capture_breakpoint<C: JdwpClient>(
        &mut self,
        client: &mut C,
        thread: ThreadId,
        location: Location,
    ) -> Result<BreakpointHit, CollectError> {
        let available = client.frame_count(thread)?;
        let mut depth = self.collector.config().stack_trace_depth;
        if depth > available {
            tracing::warn!(
                target = "patchprobe.collector",
                "Stack trace depth cannot be larger than actual. Processing {available} frames instead."
            );
            depth = available;
        }

        let stack_trace = self.collector.stack_trace(client, thread)?;
        let frames = client.frames(thread, 0, depth)?;
        let mut snapshots = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            match self
                .collector
                .capture_frame(client, thread, frame, i + 1, stack_trace.clone())
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err @ CollectError::MissingDebugInfo { .. }) if i > 0 => {
                    tracing::warn!(
                        target = "patchprobe.collector",
                        frame = i + 1,
                        error = %err,
                        "no debug information for this frame and those below it"
                    );
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(BreakpointHit {
            file: source_path(client, location.class_id)?,
            line: client.line_of(&location)?.unwrap_or_default(),
            frames: snapshots,
        })
    }
}

impl<C: JdwpClient> EventHandler<C> for Orchestrator<'_> {
    fn on_breakpoint(
        &mut self,
        client: &mut C,
        thread: ThreadId,
        location: Location,
    ) -> Result<(), CollectError> {
        if self.spec.breakpoints.is_none() {
            return Ok(());
        }
        let hit = self.capture_breakpoint(client, thread, location)?;
        tracing::debug!(
            target = "patchprobe.collector",
            file = %hit.file,
            line = hit.line,
            frames = hit.frames.len(),
            "breakpoint hit"
        );
        self.results.breakpoint_hits.push(hit);
        Ok(())
    }

    fn on_method_exit(
        &mut self,
        client: &mut C,
        thread: ThreadId,
        location: Location,
        return_value: Option<JdwpValue>,
    ) -> Result<(), CollectError> {
        let Some(method) = client.method_at(&location)? else {
            tracing::debug!(target = "patchprobe.collector", ?location, "method exit in unknown method");
            return Ok(());
        };
        let type_name = client.type_name(location.class_id)?;
        let line = client.line_of(&location)?;
        if !self
            .spec
            .method_exit_qualifies(&type_name, &method.name, line)
        {
            return Ok(());
        }

        let arguments = match client.frames(thread, 0, 1)?.first() {
            Some(frame) => match self.collector.capture_arguments(client, thread, frame) {
                Ok(arguments) => arguments,
                Err(err) if err.is_absent_information() => {
                    tracing::warn!(
                        target = "patchprobe.collector",
                        class = %type_name,
                        method = %method.name,
                        "no variable table; arguments not captured"
                    );
                    Vec::new()
                }
                Err(err) => return Err(err.into()),
            },
            None => Vec::new(),
        };

        let return_type = method.return_type_name();
        let return_value = self.collector.capture_value(
            client,
            RuntimeValueKind::ReturnValue,
            Some(method.name.clone()),
            return_type.clone(),
            &return_value.unwrap_or(JdwpValue::Void),
        );
        let record = MethodExitRecord {
            method_name: method.name,
            return_type,
            location: location_string(client, &location)?,
            arguments,
            stack_trace: self.collector.stack_trace(client, thread)?,
            return_value,
        };
        tracing::debug!(
            target = "patchprobe.collector",
            method = %record.method_name,
            location = %record.location,
            "method exit"
        );
        self.results.method_exits.push(record);
        Ok(())
    }
}

/// Register `spec`'s requests on an attached, suspended VM, resume it and
/// record events until the session ends.
pub fn collect<C: JdwpClient>(
    session: &mut DebugSession<C>,
    spec: &InstrumentationSpec,
    config: &CollectorConfig,
    cancel: &CancellationToken,
) -> Result<CollectionResults, CollectError> {
    let registration = dispatch::register_watches(session, spec)?;
    tracing::info!(
        target = "patchprobe.collector",
        breakpoints = registration.breakpoints,
        skipped = registration.skipped_lines,
        "initial requests registered"
    );
    session.client_mut().resume()?;

    let mut orchestrator = Orchestrator::new(spec, config.clone());
    let exit = dispatch::run_loop(session, spec, &mut orchestrator, cancel)?;
    let results = orchestrator.into_results();
    tracing::info!(
        target = "patchprobe.collector",
        ?exit,
        breakpoint_hits = results.breakpoint_hits.len(),
        method_exits = results.method_exits.len(),
        "collection finished"
    );
    Ok(results)
}

/// Launch the test JVM, collect, and tear the session down.
pub fn run(
    config: &PatchprobeConfig,
    request: &LaunchRequest,
    spec: &InstrumentationSpec,
    cancel: &CancellationToken,
) -> Result<CollectionResults, CollectError> {
    let mut session = launch::launch(&config.launch, request, cancel)?;
    let results = collect(&mut session, spec, &config.collector, cancel);
    session.terminate();
    results
}
