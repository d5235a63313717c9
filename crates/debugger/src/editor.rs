use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

pub type BufferId = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// The editor front-end, as seen by the debugger bridge.
///
/// Methods returning a future wait for the editor to answer; the others are
/// fire-and-forget.
#[async_trait]
pub trait Editor: Send {
    /// Next request sent by the editor.
    async fn next_message(&mut self) -> Result<Value>;

    /// Creates the debugger's display buffers, returning their ids by name.
    async fn init_buffers(&mut self) -> Result<HashMap<String, BufferId>>;

    /// Id of the (listed) buffer editing `path`, created if needed.
    async fn buffer_add(&mut self, path: &str) -> Result<BufferId>;

    async fn buffer_name(&mut self, buffer: BufferId) -> Result<String>;

    async fn cwd(&mut self) -> Result<PathBuf>;

    /// Makes `dir` the working directory the debugger is started from.
    fn change_dir(&mut self, dir: &Path) -> Result<()>;

    async fn eval(&mut self, expr: &str) -> Result<Value>;

    /// Replaces the content of a read-only display buffer.
    fn update_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()>;

    /// Replaces the content of an ordinary, editable buffer.
    fn set_buffer_lines(&mut self, buffer: BufferId, lines: &[String]) -> Result<()>;

    fn append_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()>;

    fn scroll_to_bottom(&mut self, buffer: BufferId) -> Result<()>;

    fn sign_place(&mut self, id: u32, name: &str, buffer: BufferId, line: u32) -> Result<()>;

    fn sign_unplace(&mut self, id: u32) -> Result<()>;

    fn sign_jump(&mut self, buffer: BufferId, id: u32) -> Result<()>;

    fn echo(&mut self, message: &str, level: MessageLevel) -> Result<()>;

    /// Lets the editor arrange its layout for `mode`.
    fn mode_setup(&mut self, mode: &str) -> Result<()>;

    fn mode_teardown(&mut self, mode: &str) -> Result<()>;

    fn open_in_tab(&mut self, buffer: BufferId) -> Result<()>;

    fn show_logs(&mut self) -> Result<()>;
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::{EditorOp, FakeEditor};

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::*;
    use anyhow::anyhow;
    use smol::channel;

    pub const SURFACE_NAMES: [&str; 7] = [
        "backtrace",
        "breakpoints",
        "disassembly",
        "threads",
        "locals",
        "registers",
        "logs",
    ];

    #[derive(Clone, Debug, PartialEq)]
    pub enum EditorOp {
        InitBuffers,
        BufferAdd(String),
        UpdateBuffer(BufferId, Vec<String>),
        SetBufferLines(BufferId, Vec<String>),
        AppendBuffer(BufferId, Vec<String>),
        ScrollToBottom(BufferId),
        SignPlace {
            id: u32,
            name: String,
            buffer: BufferId,
            line: u32,
        },
        SignUnplace(u32),
        SignJump(BufferId, u32),
        Echo(String, MessageLevel),
        Eval(String),
        ChangeDir(PathBuf),
        ModeSetup(String),
        ModeTeardown(String),
        OpenInTab(BufferId),
        ShowLogs,
    }

    /// Records every operation and keeps buffer contents in memory.
    pub struct FakeEditor {
        ops: Vec<EditorOp>,
        messages_tx: channel::Sender<Value>,
        messages_rx: channel::Receiver<Value>,
        surfaces: HashMap<String, BufferId>,
        files: HashMap<String, BufferId>,
        names: HashMap<BufferId, String>,
        contents: HashMap<BufferId, Vec<String>>,
        eval_replies: HashMap<String, Value>,
        cwd: PathBuf,
        next_buffer: BufferId,
    }

    impl Default for FakeEditor {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FakeEditor {
        pub fn new() -> Self {
            let (messages_tx, messages_rx) = channel::unbounded();
            let surfaces = SURFACE_NAMES
                .iter()
                .zip(1..)
                .map(|(name, id)| (name.to_string(), id))
                .collect();
            Self {
                ops: Vec::new(),
                messages_tx,
                messages_rx,
                surfaces,
                files: HashMap::default(),
                names: HashMap::default(),
                contents: HashMap::default(),
                eval_replies: HashMap::default(),
                cwd: PathBuf::from("/"),
                next_buffer: 100,
            }
        }

        pub fn ops(&self) -> &[EditorOp] {
            &self.ops
        }

        pub fn take_ops(&mut self) -> Vec<EditorOp> {
            std::mem::take(&mut self.ops)
        }

        /// Queues a request as if the editor had sent it.
        pub fn push_message(&self, message: Value) {
            self.messages_tx.try_send(message).ok();
        }

        pub fn close(&self) {
            self.messages_tx.close();
        }

        /// A handle for feeding requests while the editor is borrowed.
        pub fn message_sender(&self) -> channel::Sender<Value> {
            self.messages_tx.clone()
        }

        pub fn set_eval_reply(&mut self, expr: &str, reply: Value) {
            self.eval_replies.insert(expr.to_string(), reply);
        }

        pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
            self.cwd = cwd.into();
        }

        pub fn surface(&self, name: &str) -> BufferId {
            self.surfaces[name]
        }

        pub fn buffer_for(&self, path: &str) -> Option<BufferId> {
            self.files.get(path).copied()
        }

        pub fn lines(&self, buffer: BufferId) -> Vec<String> {
            self.contents.get(&buffer).cloned().unwrap_or_default()
        }

        pub fn echoes(&self) -> Vec<(String, MessageLevel)> {
            self.ops
                .iter()
                .filter_map(|op| match op {
                    EditorOp::Echo(message, level) => Some((message.clone(), *level)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Editor for FakeEditor {
        async fn next_message(&mut self) -> Result<Value> {
            self.messages_rx
                .recv()
                .await
                .map_err(|_| vim_rpc::ProtocolError::Disconnected.into())
        }

        async fn init_buffers(&mut self) -> Result<HashMap<String, BufferId>> {
            self.ops.push(EditorOp::InitBuffers);
            Ok(self.surfaces.clone())
        }

        async fn buffer_add(&mut self, path: &str) -> Result<BufferId> {
            self.ops.push(EditorOp::BufferAdd(path.to_string()));
            if let Some(buffer) = self.files.get(path) {
                return Ok(*buffer);
            }
            let buffer = self.next_buffer;
            self.next_buffer += 1;
            self.files.insert(path.to_string(), buffer);
            self.names.insert(buffer, path.to_string());
            Ok(buffer)
        }

        async fn buffer_name(&mut self, buffer: BufferId) -> Result<String> {
            Ok(self.names.get(&buffer).cloned().unwrap_or_default())
        }

        async fn cwd(&mut self) -> Result<PathBuf> {
            Ok(self.cwd.clone())
        }

        async fn eval(&mut self, expr: &str) -> Result<Value> {
            self.ops.push(EditorOp::Eval(expr.to_string()));
            Ok(self.eval_replies.get(expr).cloned().unwrap_or(Value::Null))
        }

        /// Only moves the fake's own cwd; the test process stays put.
        fn change_dir(&mut self, dir: &Path) -> Result<()> {
            self.ops.push(EditorOp::ChangeDir(dir.to_path_buf()));
            if !dir.is_dir() {
                return Err(anyhow!("no such directory: {}", dir.display()));
            }
            self.cwd = dir.to_path_buf();
            Ok(())
        }

        fn update_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
            self.ops.push(EditorOp::UpdateBuffer(buffer, lines.to_vec()));
            self.contents.insert(buffer, lines.to_vec());
            Ok(())
        }

        fn set_buffer_lines(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
            self.ops.push(EditorOp::SetBufferLines(buffer, lines.to_vec()));
            self.contents.insert(buffer, lines.to_vec());
            Ok(())
        }

        fn append_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
            self.ops.push(EditorOp::AppendBuffer(buffer, lines.to_vec()));
            self.contents.entry(buffer).or_default().extend_from_slice(lines);
            Ok(())
        }

        fn scroll_to_bottom(&mut self, buffer: BufferId) -> Result<()> {
            self.ops.push(EditorOp::ScrollToBottom(buffer));
            Ok(())
        }

        fn sign_place(&mut self, id: u32, name: &str, buffer: BufferId, line: u32) -> Result<()> {
            self.ops.push(EditorOp::SignPlace {
                id,
                name: name.to_string(),
                buffer,
                line,
            });
            Ok(())
        }

        fn sign_unplace(&mut self, id: u32) -> Result<()> {
            self.ops.push(EditorOp::SignUnplace(id));
            Ok(())
        }

        fn sign_jump(&mut self, buffer: BufferId, id: u32) -> Result<()> {
            self.ops.push(EditorOp::SignJump(buffer, id));
            Ok(())
        }

        fn echo(&mut self, message: &str, level: MessageLevel) -> Result<()> {
            self.ops.push(EditorOp::Echo(message.to_string(), level));
            Ok(())
        }

        fn mode_setup(&mut self, mode: &str) -> Result<()> {
            self.ops.push(EditorOp::ModeSetup(mode.to_string()));
            Ok(())
        }

        fn mode_teardown(&mut self, mode: &str) -> Result<()> {
            self.ops.push(EditorOp::ModeTeardown(mode.to_string()));
            Ok(())
        }

        fn open_in_tab(&mut self, buffer: BufferId) -> Result<()> {
            self.ops.push(EditorOp::OpenInTab(buffer));
            Ok(())
        }

        fn show_logs(&mut self) -> Result<()> {
            self.ops.push(EditorOp::ShowLogs);
            Ok(())
        }
    }
}
