use crate::{
    controller::Controller,
    editor::{BufferId, Editor},
    session::Session,
};
use anyhow::Result;
use futures::future::{self, Either};
use gdb_mi::Scheduling;
use serde_json::Value;
use thiserror::Error;
use util::ResultExt;
use vim_rpc::ProtocolError;

const REQUESTS: [&str; 9] = [
    "session",
    "mode",
    "exec",
    "stdin",
    "exit",
    "interrupt",
    "breakswitch",
    "breakdelete",
    "refresh",
];

/// A notification sent by the editor plugin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Session { command: String, args: Vec<String> },
    Mode(String),
    Exec(Vec<String>),
    Stdin(String),
    Exit,
    Interrupt,
    BreakSwitch { buffer: BufferId, line: u32 },
    BreakDelete(String),
    Refresh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("expected a request list, got {0}")]
    NotAList(String),
    #[error("unknown request {0:?}")]
    Unknown(String),
    #[error("invalid arguments for {0:?}")]
    InvalidArguments(String),
}

fn arg_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn arg_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl Request {
    pub fn parse(message: &Value) -> Result<Self, RequestError> {
        let not_a_list = || RequestError::NotAList(message.to_string());
        let (head, args) = message
            .as_array()
            .and_then(|items| items.split_first())
            .ok_or_else(not_a_list)?;
        let head = head.as_str().ok_or_else(not_a_list)?;
        let invalid = || RequestError::InvalidArguments(head.to_string());
        let strings = || {
            args.iter()
                .map(arg_string)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(invalid)
        };

        let request = match (head, args) {
            ("session", [_, ..]) => {
                let mut words = strings()?;
                let command = words.remove(0);
                Request::Session {
                    command,
                    args: words,
                }
            }
            ("mode", [name]) => Request::Mode(arg_string(name).ok_or_else(invalid)?),
            ("exec", [_, ..]) => Request::Exec(strings()?),
            ("stdin", [text]) => Request::Stdin(arg_string(text).ok_or_else(invalid)?),
            ("exit", []) => Request::Exit,
            ("interrupt", []) => Request::Interrupt,
            ("breakswitch", [buffer, line]) => Request::BreakSwitch {
                buffer: arg_integer(buffer).ok_or_else(invalid)?,
                line: arg_integer(line)
                    .and_then(|line| u32::try_from(line).ok())
                    .ok_or_else(invalid)?,
            },
            ("breakdelete", [id]) => Request::BreakDelete(arg_string(id).ok_or_else(invalid)?),
            ("refresh", []) => Request::Refresh,
            _ if REQUESTS.contains(&head) => return Err(invalid()),
            _ => return Err(RequestError::Unknown(head.to_string())),
        };
        Ok(request)
    }
}

enum Event {
    Editor(Result<Value>),
    DebuggerReadable,
}

/// Serves editor requests until the editor goes away.
pub struct Middleman<E> {
    controller: Controller<E>,
    session: Session,
}

impl<E: Editor> Middleman<E> {
    pub fn new(controller: Controller<E>) -> Self {
        Self {
            controller,
            session: Session::new(),
        }
    }

    pub fn controller(&self) -> &Controller<E> {
        &self.controller
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn run(&mut self) -> Result<()> {
        let result = loop {
            let message = match self.next_event().await {
                Event::Editor(message) => message,
                Event::DebuggerReadable => {
                    self.controller.poke().await.log_err();
                    continue;
                }
            };

            let message = match message {
                Ok(message) => message,
                Err(error) => match error.downcast_ref::<ProtocolError>() {
                    Some(ProtocolError::Disconnected) => {
                        log::info!("editor disconnected");
                        break Ok(());
                    }
                    _ => break Err(error),
                },
            };

            let request = match Request::parse(&message) {
                Ok(request) => request,
                Err(error) => {
                    log::error!("ignoring editor message: {error}");
                    continue;
                }
            };
            log::debug!("handling {request:?}");
            if let Err(error) = self.handle(request).await {
                if error.downcast_ref::<ProtocolError>().is_some() {
                    break Err(error);
                }
                log::error!("{error:#}");
            }
        };

        self.controller.dbg_stop().await.log_err();
        result
    }

    /// Waits for the editor, and in reactor mode also for debugger output.
    async fn next_event(&mut self) -> Event {
        let demux = self.controller.demux().clone();
        let message = self.controller.editor_mut().next_message();
        if !matches!(demux.scheduling(), Scheduling::Reactor { .. }) {
            return Event::Editor(message.await);
        }

        let readable = demux.readable();
        futures::pin_mut!(readable);
        match future::select(message, readable).await {
            Either::Left((message, _)) => Event::Editor(message),
            Either::Right(((), _)) => Event::DebuggerReadable,
        }
    }

    pub async fn handle(&mut self, request: Request) -> Result<()> {
        let controller = &mut self.controller;
        match request {
            Request::Session { command, args } => {
                self.session.handle(controller, &command, &args).await
            }
            Request::Mode(mode) => self.session.set_mode(controller, &mode).await,
            Request::Exec(words) => {
                controller.execute(&words.join(" ")).await?;
                if words.first().map(String::as_str) == Some("help") {
                    controller.editor_mut().show_logs()?;
                }
                Ok(())
            }
            Request::Stdin(text) => controller.put_stdin(&text).await,
            Request::Exit => controller.dbg_stop().await.map(drop),
            Request::Interrupt => controller.dbg_interrupt(),
            Request::BreakSwitch { buffer, line } => {
                let toggle = controller.do_breakswitch(buffer, line).await?;
                self.session.record_breakpoint(&toggle);
                Ok(())
            }
            Request::BreakDelete(id) => controller.do_breakdelete(&id).await,
            Request::Refresh => controller.update_buffers(None).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{EditorOp, FakeEditor, MessageLevel};
    use gdb_mi::{Demultiplexer, FakeLauncher, Record};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};

    fn middleman(launcher: Arc<FakeLauncher>) -> Middleman<FakeEditor> {
        let demux = Demultiplexer::new(
            launcher,
            Scheduling::Reactor {
                poke_timeout: Duration::from_millis(5),
            },
        );
        Middleman::new(Controller::new(
            FakeEditor::new(),
            demux,
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn test_parse_requests() {
        let parse = |message: Value| Request::parse(&message);
        assert_eq!(
            parse(json!(["session", "load", "gdb.vim.json"])),
            Ok(Request::Session {
                command: "load".into(),
                args: vec!["gdb.vim.json".into()],
            })
        );
        assert_eq!(
            parse(json!(["exec", "print", "x"])),
            Ok(Request::Exec(vec!["print".into(), "x".into()]))
        );
        assert_eq!(
            parse(json!(["breakswitch", 3, "42"])),
            Ok(Request::BreakSwitch {
                buffer: 3,
                line: 42
            })
        );
        assert_eq!(parse(json!(["breakdelete", 2])), Ok(Request::BreakDelete("2".into())));
        assert_eq!(parse(json!(["refresh"])), Ok(Request::Refresh));

        assert_eq!(
            parse(json!(["exit", "now"])),
            Err(RequestError::InvalidArguments("exit".into()))
        );
        assert_eq!(
            parse(json!(["breakswitch", 3, -1])),
            Err(RequestError::InvalidArguments("breakswitch".into()))
        );
        assert_eq!(parse(json!(["exec"])), Err(RequestError::InvalidArguments("exec".into())));
        assert_eq!(parse(json!(["dance"])), Err(RequestError::Unknown("dance".into())));
        assert!(matches!(parse(json!([])), Err(RequestError::NotAList(_))));
        assert!(matches!(parse(json!({ "mode": "debug" })), Err(RequestError::NotAList(_))));
    }

    #[test]
    fn test_run_until_editor_disconnects() {
        smol::block_on(async {
            let mut middleman = middleman(FakeLauncher::answering_done());
            let editor = middleman.controller.editor_mut();
            editor.push_message(json!(["session", "bogus"]));
            editor.push_message(json!(["dance"]));
            editor.push_message(json!(["exec", "help", "all"]));
            editor.close();

            middleman.run().await.unwrap();
            let editor = middleman.controller().editor();
            assert_eq!(
                editor.echoes(),
                vec![("Invalid sub-command: bogus".to_string(), MessageLevel::Warning)]
            );
            assert_eq!(editor.ops().last(), Some(&EditorOp::ShowLogs));
            let logs = editor.lines(editor.surface("logs"));
            assert_eq!(logs, vec!["→(gdb) help all", "✗debugger is not running"]);
        });
    }

    #[test]
    fn test_debug_session_through_requests() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("gdb.vim.json");
            std::fs::write(
                &path,
                r#"{ "modes": { "debug": { "setup": ["file a.out"] }, "code": {} } }"#,
            )
            .unwrap();

            let launcher = FakeLauncher::answering_done();
            let mut middleman = middleman(launcher.clone());
            let editor = middleman.controller.editor_mut();
            editor.push_message(json!(["session", "load", path.to_string_lossy()]));
            editor.push_message(json!(["exec", "-exec-run"]));
            editor.push_message(json!(["interrupt"]));
            editor.push_message(json!(["mode", "code"]));
            editor.close();

            middleman.run().await.unwrap();
            assert_eq!(middleman.session().current_mode(), Some("code"));
            let process = launcher.last().unwrap();
            let written = process.written();
            assert_eq!(written[0], "file a.out");
            assert!(written.contains(&"-exec-run".to_string()));
            assert_eq!(process.interrupt_count(), 2);
            assert!(process.has_exited());
        });
    }

    #[test]
    fn test_reactor_routes_debugger_output_between_requests() {
        smol::block_on(async {
            let launcher = FakeLauncher::answering_done();
            let mut middleman = middleman(launcher.clone());
            middleman.controller.dbg_start().unwrap();
            let demux = middleman.controller().demux().clone();
            let process = launcher.last().unwrap();
            let messages = middleman.controller().editor().message_sender();

            let editor = async {
                process.emit(Record::output("Starting program\n", gdb_mi::Stream::Stdout));
                process.emit(Record::result("running", None));
                smol::Timer::after(Duration::from_millis(50)).await;
                let routed = demux.results().try_take();
                messages.close();
                routed
            };
            let (result, routed) = future::join(middleman.run(), editor).await;
            result.unwrap();

            assert_eq!(routed.and_then(|record| record.message), Some("running".into()));
            assert!(process.has_exited());
        });
    }
}
