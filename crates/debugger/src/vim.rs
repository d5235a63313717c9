use crate::editor::{BufferId, Editor, MessageLevel};
use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use vim_rpc::Connection;

/// [`Editor`] backed by Vim's channel protocol and the `gdb#` autoload
/// functions of the plugin.
pub struct Vim {
    connection: Connection,
}

impl Vim {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    fn call(&mut self, function: &str, args: Vec<Value>) -> Result<()> {
        Ok(self.connection.call_no_reply(function, args)?)
    }

    fn command(&mut self, command: &str) -> Result<()> {
        Ok(self.connection.command(command)?)
    }
}

/// Quotes `message` for a double-quoted Vim string.
fn vim_string(message: &str) -> String {
    message
        .trim()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[async_trait]
impl Editor for Vim {
    async fn next_message(&mut self) -> Result<Value> {
        Ok(self.connection.receive_next().await?)
    }

    async fn init_buffers(&mut self) -> Result<HashMap<String, BufferId>> {
        let buffers = self.connection.call("gdb#layout#init_buffers", vec![]).await?;
        serde_json::from_value(buffers).context("invalid buffer map from gdb#layout#init_buffers")
    }

    async fn buffer_add(&mut self, path: &str) -> Result<BufferId> {
        let buffer = self
            .connection
            .call("bufnr", vec![json!(path), json!(1)])
            .await?
            .as_i64()
            .ok_or_else(|| anyhow!("bufnr returned a non-number for {path:?}"))?;
        self.call("setbufvar", vec![json!(buffer), json!("&bl"), json!(1)])?;
        Ok(buffer)
    }

    async fn buffer_name(&mut self, buffer: BufferId) -> Result<String> {
        match self.connection.call("bufname", vec![json!(buffer)]).await? {
            Value::String(name) => Ok(name),
            other => Err(anyhow!("bufname returned {other}")),
        }
    }

    async fn cwd(&mut self) -> Result<PathBuf> {
        match self.connection.call("getcwd", vec![]).await? {
            Value::String(cwd) => Ok(PathBuf::from(cwd)),
            other => Err(anyhow!("getcwd returned {other}")),
        }
    }

    async fn eval(&mut self, expr: &str) -> Result<Value> {
        Ok(self.connection.eval(expr).await?)
    }

    fn change_dir(&mut self, dir: &Path) -> Result<()> {
        std::env::set_current_dir(dir)
            .with_context(|| format!("failed to change directory to {}", dir.display()))
    }

    fn update_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
        self.call("gdb#layout#update_buffer", vec![json!(buffer), json!(lines)])
    }

    fn set_buffer_lines(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
        self.call("setbufline", vec![json!(buffer), json!(1), json!(lines)])?;
        self.call(
            "deletebufline",
            vec![json!(buffer), json!(lines.len() + 1), json!("$")],
        )
    }

    fn append_buffer(&mut self, buffer: BufferId, lines: &[String]) -> Result<()> {
        self.call("appendbufline", vec![json!(buffer), json!("$"), json!(lines)])
    }

    fn scroll_to_bottom(&mut self, buffer: BufferId) -> Result<()> {
        self.call("gdb#util#buffer_do", vec![json!(buffer), json!("normal! G")])
    }

    fn sign_place(&mut self, id: u32, name: &str, buffer: BufferId, line: u32) -> Result<()> {
        self.command(&format!(
            "sign place {id} name={name} line={line} buffer={buffer}"
        ))
    }

    fn sign_unplace(&mut self, id: u32) -> Result<()> {
        self.command(&format!("sign unplace {id}"))
    }

    fn sign_jump(&mut self, buffer: BufferId, id: u32) -> Result<()> {
        self.call("gdb#layout#signjump", vec![json!(buffer), json!(id)])
    }

    fn echo(&mut self, message: &str, level: MessageLevel) -> Result<()> {
        let highlight = match level {
            MessageLevel::Info => "None",
            MessageLevel::Warning => "WarningMsg",
            MessageLevel::Error => "ErrorMsg",
        };
        self.command(&format!(
            "echohl {highlight} | echom \"{}\" | echohl None",
            vim_string(message)
        ))
    }

    fn mode_setup(&mut self, mode: &str) -> Result<()> {
        self.command(&format!(
            "call call(g:gdb#session#mode_setup, ['{}'])",
            mode.replace('\'', "''")
        ))
    }

    fn mode_teardown(&mut self, mode: &str) -> Result<()> {
        self.command(&format!(
            "call call(g:gdb#session#mode_teardown, ['{}'])",
            mode.replace('\'', "''")
        ))
    }

    fn open_in_tab(&mut self, buffer: BufferId) -> Result<()> {
        self.command(&format!(
            "exe \"tab drop \".escape(bufname({buffer}), \"$%# \")"
        ))
    }

    fn show_logs(&mut self) -> Result<()> {
        self.command("drop [gdb]logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_buffer_add_lists_the_buffer() {
        smol::block_on(async {
            let (connection, editor) = Connection::fake();
            let mut vim = Vim::new(connection);
            editor.push(-2, json!(7));

            assert_eq!(vim.buffer_add("/src/main.c").await.unwrap(), 7);
            assert_eq!(
                editor.drain_outbound(),
                vec![
                    json!(["call", "bufnr", ["/src/main.c", 1], -2]),
                    json!(["call", "setbufvar", [7, "&bl", 1]]),
                ]
            );
        });
    }

    #[test]
    fn test_init_buffers() {
        smol::block_on(async {
            let (connection, editor) = Connection::fake();
            let mut vim = Vim::new(connection);
            editor.push(-2, json!({ "logs": 3, "backtrace": 4 }));

            let buffers = vim.init_buffers().await.unwrap();
            assert_eq!(buffers["logs"], 3);
            assert_eq!(buffers["backtrace"], 4);

            editor.push(-3, json!("nope"));
            assert!(vim.init_buffers().await.is_err());
        });
    }

    #[test]
    fn test_fire_and_forget_commands() {
        let (connection, editor) = Connection::fake();
        let mut vim = Vim::new(connection);
        vim.sign_place(12, "gdb_bp", 3, 40).unwrap();
        vim.sign_unplace(12).unwrap();
        vim.echo("say \"hi\"\nthere ", MessageLevel::Warning).unwrap();
        vim.mode_setup("debug").unwrap();
        vim.scroll_to_bottom(5).unwrap();

        assert_eq!(
            editor.drain_outbound(),
            vec![
                json!(["ex", "sign place 12 name=gdb_bp line=40 buffer=3"]),
                json!(["ex", "sign unplace 12"]),
                json!(["ex", "echohl WarningMsg | echom \"say \\\"hi\\\"\\nthere\" | echohl None"]),
                json!(["ex", "call call(g:gdb#session#mode_setup, ['debug'])"]),
                json!(["call", "gdb#util#buffer_do", [5, "normal! G"]]),
            ]
        );
    }

    #[test]
    fn test_next_message_surfaces_protocol_errors() {
        smol::block_on(async {
            let (connection, editor) = Connection::fake();
            let mut vim = Vim::new(connection);
            editor.push(1, json!(["refresh"]));
            editor.push(-5, json!(null));

            assert_eq!(vim.next_message().await.unwrap(), json!(["refresh"]));
            let error = vim.next_message().await.unwrap_err();
            assert_eq!(
                error.downcast_ref::<vim_rpc::ProtocolError>(),
                Some(&vim_rpc::ProtocolError::UnsolicitedReply(-5))
            );
        });
    }
}
