use crate::{
    editor::{BufferId, Editor},
    signs::SignReconciler,
};
use anyhow::{anyhow, Result};
use gdb_mi::Record;
use serde_json::Value;
use std::{collections::HashMap, fmt, str::FromStr};

const LOGS: &str = "logs";

/// A read-only buffer showing the output of one debugger command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Surface {
    Backtrace,
    Breakpoints,
    Disassembly,
    Threads,
    Locals,
    Registers,
}

impl Surface {
    pub const ALL: [Surface; 6] = [
        Surface::Backtrace,
        Surface::Breakpoints,
        Surface::Disassembly,
        Surface::Threads,
        Surface::Locals,
        Surface::Registers,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Surface::Backtrace => "backtrace",
            Surface::Breakpoints => "breakpoints",
            Surface::Disassembly => "disassembly",
            Surface::Threads => "threads",
            Surface::Locals => "locals",
            Surface::Registers => "registers",
        }
    }

    pub fn command(self) -> &'static str {
        match self {
            Surface::Backtrace => "-stack-list-frames",
            Surface::Breakpoints => "-break-list",
            Surface::Disassembly => "-data-disassemble -s $pc -e \"$pc + 96\" -- 0",
            Surface::Threads => "-thread-info",
            Surface::Locals => "-stack-list-variables --simple-values",
            Surface::Registers => "-data-list-register-values --skip-unavailable x",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Surface {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        Surface::ALL
            .into_iter()
            .find(|surface| surface.name() == name)
            .ok_or_else(|| anyhow!("unknown buffer {name:?}"))
    }
}

/// The debugger's display buffers and the signs in source buffers.
#[derive(Default)]
pub struct Buffers {
    buffer_ids: HashMap<String, BufferId>,
    rendered: HashMap<BufferId, Vec<String>>,
    pub(crate) signs: SignReconciler,
}

impl Buffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signs(&self) -> &SignReconciler {
        &self.signs
    }

    async fn buffer_id<E: Editor>(&mut self, editor: &mut E, name: &str) -> Result<BufferId> {
        if self.buffer_ids.is_empty() {
            self.buffer_ids = editor.init_buffers().await?;
        }
        self.buffer_ids
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("editor did not create a {name:?} buffer"))
    }

    /// Appends `text` to the logs buffer, with `prefix` in front of every
    /// line. Returns the number of complete lines appended.
    pub async fn logs_append<E: Editor>(
        &mut self,
        editor: &mut E,
        text: &str,
        prefix: Option<&str>,
    ) -> Result<usize> {
        if text.is_empty() {
            return Ok(0);
        }
        let buffer = self.buffer_id(editor, LOGS).await?;

        let text = text.replace("\r\n", "\n");
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let complete = lines.len() - 1;
        if lines.last().map_or(false, String::is_empty) {
            lines.pop();
        }
        if let Some(prefix) = prefix {
            for line in &mut lines {
                line.insert_str(0, prefix);
            }
        }

        for line in &lines {
            log::debug!("logs: {line}");
        }
        editor.append_buffer(buffer, &lines)?;
        editor.scroll_to_bottom(buffer)?;
        Ok(complete)
    }

    /// Shows `lines` in the surface's buffer unless it already shows exactly
    /// that. Returns whether the buffer was updated.
    pub async fn render<E: Editor>(
        &mut self,
        editor: &mut E,
        surface: Surface,
        lines: Vec<String>,
    ) -> Result<bool> {
        let buffer = self.buffer_id(editor, surface.name()).await?;
        if self.rendered.get(&buffer) == Some(&lines) {
            return Ok(false);
        }
        editor.update_buffer(buffer, &lines)?;
        self.rendered.insert(buffer, lines);
        Ok(true)
    }
}

/// Formats a command's result for the logs buffer.
pub fn serialize_record(record: &Record) -> String {
    let message = record.message.as_deref().unwrap_or("none");
    let token = record
        .token
        .map_or_else(|| "none".to_string(), |token| token.to_string());
    let payload = match &record.payload {
        Some(Value::String(text)) => text.clone(),
        Some(payload) => payload.to_string(),
        None => String::new(),
    };
    format!(
        "message: {message}, stream: {}, token: {token}, type: {}\n{payload}\n",
        record.stream, record.kind
    )
}

/// Lines shown in a surface for a command's result.
pub fn render_record(record: &Record) -> Vec<String> {
    if record.message.as_deref() == Some("error") {
        let message = record
            .payload
            .as_ref()
            .and_then(|payload| payload.get("msg"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return vec![format!("error: {message}")];
    }
    match &record.payload {
        Some(payload) => serde_json::to_string_pretty(payload)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{EditorOp, FakeEditor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_logs_append_prefixes_lines() {
        smol::block_on(async {
            let mut editor = FakeEditor::new();
            let mut buffers = Buffers::new();

            assert_eq!(buffers.logs_append(&mut editor, "", None).await.unwrap(), 0);
            assert!(editor.ops().is_empty());

            let count = buffers
                .logs_append(&mut editor, "one\r\ntwo\n", Some("✓"))
                .await
                .unwrap();
            assert_eq!(count, 2);
            let count = buffers
                .logs_append(&mut editor, "partial", Some("✗"))
                .await
                .unwrap();
            assert_eq!(count, 0);

            let logs = editor.surface("logs");
            assert_eq!(editor.lines(logs), vec!["✓one", "✓two", "✗partial"]);
            assert_eq!(editor.ops()[0], EditorOp::InitBuffers);
            assert_eq!(editor.ops().last(), Some(&EditorOp::ScrollToBottom(logs)));
        });
    }

    #[test]
    fn test_render_skips_unchanged_content() {
        smol::block_on(async {
            let mut editor = FakeEditor::new();
            let mut buffers = Buffers::new();
            let lines = vec!["frame 0".to_string()];

            assert!(buffers
                .render(&mut editor, Surface::Backtrace, lines.clone())
                .await
                .unwrap());
            assert!(!buffers
                .render(&mut editor, Surface::Backtrace, lines)
                .await
                .unwrap());
            assert!(buffers
                .render(&mut editor, Surface::Backtrace, vec![])
                .await
                .unwrap());
            let updates = editor
                .ops()
                .iter()
                .filter(|op| matches!(op, EditorOp::UpdateBuffer(..)))
                .count();
            assert_eq!(updates, 2);
        });
    }

    #[test]
    fn test_record_formatting() {
        let record = Record::result("done", Some(json!({ "value": "42" })));
        assert_eq!(
            serialize_record(&record),
            "message: done, stream: stdout, token: none, type: result\n{\"value\":\"42\"}\n"
        );
        assert_eq!(
            render_record(&record),
            vec!["{", "  \"value\": \"42\"", "}"]
        );
        let error = Record::result("error", Some(json!({ "msg": "No registers." })));
        assert_eq!(render_record(&error), vec!["error: No registers."]);
        assert_eq!("locals".parse::<Surface>().unwrap(), Surface::Locals);
        assert!("logs".parse::<Surface>().is_err());
    }
}
