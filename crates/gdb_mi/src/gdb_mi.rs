mod demultiplexer;
#[cfg(any(test, feature = "test-support"))]
mod fake;
mod process;
mod record;
mod result_slot;
mod state;

pub use demultiplexer::{Demultiplexer, Scheduling};
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeLauncher, FakeProcess, FakeReply};
pub use process::{DebuggerProcess, GdbLauncher, GdbProcess, Launcher, ReadError};
pub use record::{ParseError, Record, RecordKind, Stream};
pub use result_slot::ResultSlot;
pub use state::{breakpoints, program_counters, BreakpointLocation, ProgramCounter};
