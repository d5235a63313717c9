use crate::{
    buffers::{render_record, serialize_record, Buffers, Surface},
    busy_gate::BusyGate,
    editor::{BufferId, Editor, MessageLevel},
};
use anyhow::Result;
use gdb_mi::{breakpoints, program_counters, BreakpointLocation, Demultiplexer, Record};
use std::{sync::Arc, time::Duration};
use thiserror::Error;

const ECHO_PREFIX: &str = "→(gdb) ";
const RESULT_PREFIX: &str = "✓";
const FAILURE_PREFIX: &str = "✗";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no result within {0:?}")]
    Timeout(Duration),
    #[error("debugger is not running")]
    NotRunning,
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Outcome of toggling a breakpoint on a source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakToggle {
    Inserted(BreakpointLocation),
    Deleted(String),
    Failed,
}

/// Runs debugger commands on behalf of the editor and keeps its buffers up
/// to date.
pub struct Controller<E> {
    editor: E,
    demux: Arc<Demultiplexer>,
    busy: BusyGate,
    buffers: Buffers,
    command_timeout: Duration,
}

impl<E: Editor> Controller<E> {
    pub fn new(editor: E, demux: Arc<Demultiplexer>, command_timeout: Duration) -> Self {
        Self {
            editor,
            demux,
            busy: BusyGate::new(),
            buffers: Buffers::new(),
            command_timeout,
        }
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn demux(&self) -> &Arc<Demultiplexer> {
        &self.demux
    }

    pub fn busy(&self) -> &BusyGate {
        &self.busy
    }

    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    pub fn echo(&mut self, message: &str, level: MessageLevel) -> Result<()> {
        self.editor.echo(message, level)
    }

    /// Starts the debugger. Returns whether a new process was launched.
    pub fn dbg_start(&mut self) -> Result<bool> {
        self.demux.start()
    }

    pub async fn dbg_stop(&mut self) -> Result<bool> {
        let stopped = self.demux.stop().await;
        if stopped {
            log::info!("terminated");
            self.update_buffers(None).await?;
        }
        Ok(stopped)
    }

    pub fn dbg_interrupt(&self) -> Result<()> {
        self.demux.interrupt()
    }

    /// Routes debugger output that became readable.
    pub async fn poke(&mut self) -> Result<usize> {
        self.demux.poke().await
    }

    /// Runs `command`, shows it and its result in the logs buffer and
    /// refreshes every surface. Returns the result, if one arrived in time.
    pub async fn execute(&mut self, command: &str) -> Result<Option<Record>> {
        self.buffers
            .logs_append(&mut self.editor, &format!("{ECHO_PREFIX}{command}\n"), None)
            .await?;
        let result = match self.command_result(command).await {
            Ok(record) => {
                self.buffers
                    .logs_append(&mut self.editor, &serialize_record(&record), Some(RESULT_PREFIX))
                    .await?;
                Some(record)
            }
            Err(error) => {
                self.buffers
                    .logs_append(&mut self.editor, &format!("{error}\n"), Some(FAILURE_PREFIX))
                    .await?;
                None
            }
        };
        self.update_buffers(None).await?;
        Ok(result)
    }

    /// Sends `command` and waits for its result without touching the
    /// buffers. Commands that change debugger state go through `execute`.
    pub async fn command_result(&self, command: &str) -> Result<Record, CommandError> {
        if !self.demux.is_running() {
            return Err(CommandError::NotRunning);
        }
        log::info!("(gdb) {command}");
        self.demux.write(command).await?;
        match self.demux.wait_for_result(self.command_timeout).await {
            Some(record) => Ok(record),
            None => {
                log::warn!("(gdb-no-result) {command}");
                Err(CommandError::Timeout(self.command_timeout))
            }
        }
    }

    /// Refreshes one surface, or the program counter signs and every surface.
    /// Does nothing while the busy gate is engaged.
    pub async fn update_buffers(&mut self, surface: Option<Surface>) -> Result<()> {
        if self.busy.is_engaged() {
            log::debug!("busy, not updating buffers");
            return Ok(());
        }
        match surface {
            Some(surface) => self.update_surface(surface, false).await,
            None => {
                self.update_pc().await?;
                for surface in Surface::ALL {
                    self.update_surface(surface, false).await?;
                }
                Ok(())
            }
        }
    }

    async fn update_pc(&mut self) -> Result<()> {
        let counters = match self.command_result("-thread-info").await {
            Ok(record) => record
                .payload
                .as_ref()
                .map(program_counters)
                .unwrap_or_default(),
            Err(CommandError::NotRunning) => Vec::new(),
            Err(error) => {
                log::warn!("could not fetch program counters: {error}");
                return Ok(());
            }
        };
        self.buffers
            .signs
            .reconcile_pc(&mut self.editor, &counters)
            .await
    }

    async fn update_surface(&mut self, surface: Surface, hard_update: bool) -> Result<()> {
        let result = self.command_result(surface.command()).await;
        if surface == Surface::Breakpoints {
            let locations = match &result {
                Ok(record) => Some(record.payload.as_ref().map(breakpoints).unwrap_or_default()),
                Err(CommandError::NotRunning) => Some(Vec::new()),
                Err(_) => None,
            };
            if let Some(locations) = locations {
                self.buffers
                    .signs
                    .reconcile_breakpoints(&mut self.editor, &locations, hard_update)
                    .await?;
            }
        }
        let lines = match &result {
            Ok(record) => render_record(record),
            Err(error) => vec![error.to_string()],
        };
        self.buffers
            .render(&mut self.editor, surface, lines)
            .await?;
        Ok(())
    }

    /// Deletes the breakpoint shown on `line`, or inserts one there.
    pub async fn do_breakswitch(&mut self, buffer: BufferId, line: u32) -> Result<BreakToggle> {
        let existing = self
            .buffers
            .signs
            .breakpoint_at((buffer, line))
            .map(|number| parent_breakpoint(number).to_string());

        let toggle = match existing {
            Some(number) => {
                let result = self.execute(&format!("-break-delete {number}")).await?;
                match result {
                    Some(record) if record.message.as_deref() == Some("done") => {
                        BreakToggle::Deleted(number)
                    }
                    _ => BreakToggle::Failed,
                }
            }
            None => {
                let name = self.editor.buffer_name(buffer).await?;
                let path = self.editor.cwd().await?.join(&name);
                self.buffers
                    .logs_append(&mut self.editor, &format!("→(gdb-bp) {name}:{line}\n"), None)
                    .await?;
                let location = format!("{}:{line}", path.display());
                let result = self
                    .execute(&format!("-break-insert {}", mi_quote(&location)))
                    .await?;
                result
                    .and_then(|record| record.payload)
                    .and_then(|payload| inserted_breakpoint(&payload))
                    .map_or(BreakToggle::Failed, BreakToggle::Inserted)
            }
        };
        self.update_breakpoints(true).await?;
        Ok(toggle)
    }

    pub async fn do_breakdelete(&mut self, id: &str) -> Result<()> {
        self.execute(&format!("-break-delete {id}")).await?;
        self.update_breakpoints(true).await
    }

    async fn update_breakpoints(&mut self, hard_update: bool) -> Result<()> {
        if self.busy.is_engaged() {
            return Ok(());
        }
        self.update_surface(Surface::Breakpoints, hard_update).await
    }

    /// Writes `input` straight to the debugger, bypassing result matching.
    pub async fn put_stdin(&mut self, input: &str) -> Result<()> {
        if !self.demux.is_running() {
            return self
                .editor
                .echo("The debugger is not running.", MessageLevel::Warning);
        }
        self.demux.write(input).await
    }
}

/// `3` for a location `3.1` of a multi-location breakpoint.
fn parent_breakpoint(number: &str) -> &str {
    number.split('.').next().unwrap_or(number)
}

fn inserted_breakpoint(payload: &serde_json::Value) -> Option<BreakpointLocation> {
    let bkpt = payload.get("bkpt")?;
    let table = serde_json::json!({ "BreakpointTable": { "body": [bkpt] } });
    breakpoints(&table).into_iter().next()
}

fn mi_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{EditorOp, FakeEditor};
    use gdb_mi::{FakeLauncher, FakeReply, Scheduling};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

    #[ctor::ctor]
    fn init_logger() {
        if std::env::var("RUST_LOG").is_ok() {
            env_logger::init();
        }
    }

    fn reactor() -> Scheduling {
        Scheduling::Reactor {
            poke_timeout: Duration::from_millis(5),
        }
    }

    fn controller(launcher: Arc<FakeLauncher>, timeout: Duration) -> Controller<FakeEditor> {
        let demux = Demultiplexer::new(launcher, reactor());
        Controller::new(FakeEditor::new(), demux, timeout)
    }

    #[test]
    fn test_execute_logs_command_and_result() {
        smol::block_on(async {
            let launcher = FakeLauncher::new(|command| {
                let payload = match command {
                    "-exec-next" => json!({ "frame": "main" }),
                    _ => json!({}),
                };
                vec![FakeReply::now(Record::result("done", Some(payload)))]
            });
            let mut controller = controller(launcher.clone(), Duration::from_secs(1));
            controller.dbg_start().unwrap();

            let record = controller.execute("-exec-next").await.unwrap().unwrap();
            assert_eq!(record.payload, Some(json!({ "frame": "main" })));

            let logs = controller.editor().lines(controller.editor().surface("logs"));
            assert_eq!(
                logs,
                vec![
                    "→(gdb) -exec-next",
                    "✓message: done, stream: stdout, token: none, type: result",
                    "✓{\"frame\":\"main\"}",
                ]
            );

            let written = launcher.last().unwrap().written();
            assert_eq!(written[0], "-exec-next");
            assert!(written.contains(&"-thread-info".to_string()));
            assert!(written.contains(&"-break-list".to_string()));
        });
    }

    #[test]
    fn test_execute_times_out_gracefully() {
        smol::block_on(async {
            let launcher = FakeLauncher::new(|_| {
                vec![FakeReply::after(
                    Duration::from_millis(250),
                    Record::result("done", None),
                )]
            });
            let mut controller = controller(launcher, Duration::from_millis(150));
            controller.dbg_start().unwrap();

            let _busy = controller.busy().guard();
            assert_eq!(controller.execute("foo").await.unwrap(), None);
            let logs = controller.editor().lines(controller.editor().surface("logs"));
            assert_eq!(logs, vec!["→(gdb) foo", "✗no result within 150ms"]);
        });
    }

    #[test]
    fn test_busy_gate_suppresses_refresh() {
        smol::block_on(async {
            let launcher = FakeLauncher::answering_done();
            let mut controller = controller(launcher.clone(), Duration::from_secs(1));
            controller.dbg_start().unwrap();

            {
                let _busy = controller.busy().guard();
                controller.execute("-exec-step").await.unwrap();
                controller.update_buffers(None).await.unwrap();
            }
            assert_eq!(launcher.last().unwrap().written(), vec!["-exec-step"]);

            controller.update_buffers(Some(Surface::Locals)).await.unwrap();
            assert_eq!(
                launcher.last().unwrap().written(),
                vec!["-exec-step", "-stack-list-variables --simple-values"]
            );
        });
    }

    #[test]
    fn test_commands_without_debugger() {
        smol::block_on(async {
            let mut controller = controller(FakeLauncher::answering_done(), Duration::from_secs(1));
            assert!(matches!(
                controller.command_result("-break-list").await,
                Err(CommandError::NotRunning)
            ));
            assert_eq!(controller.execute("run").await.unwrap(), None);
            let backtrace = controller.editor().surface("backtrace");
            assert_eq!(
                controller.editor().lines(backtrace),
                vec!["debugger is not running"]
            );

            controller.put_stdin("42").await.unwrap();
            assert_eq!(
                controller.editor().echoes(),
                vec![(
                    "The debugger is not running.".to_string(),
                    MessageLevel::Warning
                )]
            );
            assert!(!controller.dbg_stop().await.unwrap());
        });
    }

    #[test]
    fn test_breakswitch_inserts_then_deletes() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("main.c");
            std::fs::write(&source, "int main() {}\n").unwrap();
            let source = source.to_string_lossy().into_owned();

            let inserted = Arc::new(AtomicBool::new(false));
            let launcher = FakeLauncher::new({
                let inserted = inserted.clone();
                let source = source.clone();
                move |command| {
                    let bkpt = json!({ "number": "1", "fullname": source, "line": "3" });
                    let record = if command.starts_with("-break-insert") {
                        inserted.store(true, SeqCst);
                        Record::result("done", Some(json!({ "bkpt": bkpt })))
                    } else if command.starts_with("-break-delete") {
                        inserted.store(false, SeqCst);
                        Record::result("done", None)
                    } else if command == "-break-list" {
                        let body = if inserted.load(SeqCst) {
                            vec![bkpt]
                        } else {
                            vec![]
                        };
                        Record::result(
                            "done",
                            Some(json!({ "BreakpointTable": { "body": body } })),
                        )
                    } else {
                        Record::result("done", None)
                    };
                    vec![FakeReply::now(record)]
                }
            });
            let mut controller = controller(launcher.clone(), Duration::from_secs(1));
            controller.dbg_start().unwrap();
            let buffer = controller.editor_mut().buffer_add(&source).await.unwrap();

            let toggle = controller.do_breakswitch(buffer, 3).await.unwrap();
            assert_eq!(
                toggle,
                BreakToggle::Inserted(BreakpointLocation {
                    number: "1".into(),
                    path: source.clone(),
                    line: 3,
                })
            );
            assert_eq!(controller.buffers().signs().breakpoint_keys(), vec![(buffer, 3)]);
            let written = launcher.last().unwrap().written();
            assert!(written.contains(&format!("-break-insert \"{source}:3\"")));

            let toggle = controller.do_breakswitch(buffer, 3).await.unwrap();
            assert_eq!(toggle, BreakToggle::Deleted("1".into()));
            assert!(controller.buffers().signs().breakpoint_keys().is_empty());
            assert!(controller
                .editor()
                .ops()
                .iter()
                .any(|op| matches!(op, EditorOp::SignUnplace(_))));
        });
    }

    #[test]
    fn test_breakpoint_numbers() {
        assert_eq!(parent_breakpoint("3.2"), "3");
        assert_eq!(parent_breakpoint("7"), "7");
        assert_eq!(mi_quote(r#"C:\a "b".c:1"#), r#""C:\\a \"b\".c:1""#);
    }
}
