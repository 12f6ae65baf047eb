pub mod error;
pub mod event_log;
pub mod executor;
pub mod mux;
pub mod output;
pub mod pty;
pub mod registry;
pub mod session;

pub use error::MuxError;
pub use event_log::{EventLog, EventLogConfig, EventStore, LogSink};
pub use executor::{
    CommandFactory, ExecutorConfig, PassthroughCommand, ProjectWorkspace, TaskExecutor,
    TaskRequest, WorkspaceProvider,
};
pub use mux::{EventMultiplexer, MuxStream};
pub use pty::{PtyCommand, PtyEvent, PtyStreamService, WriteOutcome};
pub use registry::{ProcessRegistry, TerminateOutcome};
pub use session::{Session, SessionManager, Task, TaskHandle};
