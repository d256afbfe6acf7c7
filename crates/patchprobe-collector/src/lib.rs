//! Runtime state collection for a JUnit run under JDWP.
//!
//! A run launches the test JVM suspended ([`launch`]), asks the VM to report
//! when the instrumented classes load, sets breakpoints and method-exit
//! requests on them ([`dispatch`]) and records a snapshot of the suspended
//! thread at every qualifying event ([`orchestrator`], [`collect`]).

pub mod collect;
pub mod dispatch;
pub mod error;
pub mod launch;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod render;
pub mod session;
pub mod spec;

pub use collect::Collector;
pub use dispatch::{run_loop, EventHandler, LoopExit, Registration, ResumeGuard};
pub use error::{CollectError, LaunchError, SpecError};
pub use launch::{launch, LaunchRequest};
pub use model::{
    BreakpointHit, CollectionResults, FrameSnapshot, MethodExitRecord, Nested, RenderedValue,
    RuntimeValue, RuntimeValueKind,
};
pub use orchestrator::{collect, run, Orchestrator};
pub use output::{write_results, OutputPaths};
pub use session::{DebugSession, SessionState};
pub use spec::{BreakpointMap, InstrumentationSpec, MethodWatch};
