mod buffers;
mod busy_gate;
mod controller;
mod editor;
mod middleman;
mod session;
mod session_config;
mod settings;
mod signs;
mod vim;

pub use buffers::{Buffers, Surface};
pub use busy_gate::{BusyGate, BusyGuard};
pub use controller::{BreakToggle, CommandError, Controller};
#[cfg(any(test, feature = "test-support"))]
pub use editor::{EditorOp, FakeEditor};
pub use editor::{BufferId, Editor, MessageLevel};
pub use middleman::{Middleman, Request, RequestError};
pub use session::{Session, SessionState};
pub use session_config::{substitute, ConfigError, ModeConfig, SessionConfig, SubstitutionError};
pub use settings::{DebuggerSettings, SchedulingKind, SETTINGS_ENV};
pub use signs::{BreakpointDiff, SignKey, SignReconciler};
pub use vim::Vim;
