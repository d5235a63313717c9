use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashSet, fmt};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// `^done`, `^running`, `^error`, ...: the outcome of the last command.
    Result,
    /// `*stopped`, `=thread-created`, ...
    Notify,
    /// `+download`, ...
    Status,
    Console,
    Log,
    Target,
    /// Anything that is not MI syntax, usually the inferior's own output.
    Output,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Result => "result",
            RecordKind::Notify => "notify",
            RecordKind::Status => "status",
            RecordKind::Console => "console",
            RecordKind::Log => "log",
            RecordKind::Target => "target",
            RecordKind::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// One response line from the debugger.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub message: Option<String>,
    pub payload: Option<Value>,
    pub token: Option<u64>,
    pub stream: Stream,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message} at byte {position} of {text:?}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
    pub text: String,
}

impl Record {
    pub fn result(message: &str, payload: Option<Value>) -> Self {
        Self {
            kind: RecordKind::Result,
            message: Some(message.to_string()),
            payload,
            token: None,
            stream: Stream::Stdout,
        }
    }

    pub fn output(line: impl Into<String>, stream: Stream) -> Self {
        Self {
            kind: RecordKind::Output,
            message: None,
            payload: Some(Value::String(line.into())),
            token: None,
            stream,
        }
    }

    /// Parses one line of MI output. The `(gdb)` prompt yields `Ok(None)`;
    /// lines without MI syntax become [`RecordKind::Output`] records.
    pub fn parse_line(line: &str) -> Result<Option<Self>, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim_end() == "(gdb)" {
            return Ok(None);
        }

        let digits = line.bytes().take_while(u8::is_ascii_digit).count();
        let rest = &line[digits..];
        let marker = match rest.as_bytes().first() {
            Some(marker @ (b'^' | b'*' | b'=' | b'+' | b'~' | b'@' | b'&')) => *marker,
            _ => return Ok(Some(Self::output(line, Stream::Stdout))),
        };
        let token = line[..digits].parse::<u64>().ok();
        let body = &rest[1..];

        let record = match marker {
            b'~' | b'@' | b'&' => {
                let mut parser = Parser::new(body);
                let text = parser.parse_c_string()?;
                parser.finish()?;
                let kind = match marker {
                    b'~' => RecordKind::Console,
                    b'@' => RecordKind::Target,
                    _ => RecordKind::Log,
                };
                Self {
                    kind,
                    message: None,
                    payload: Some(Value::String(text)),
                    token,
                    stream: Stream::Stdout,
                }
            }
            _ => {
                let (class, results) = match body.find(',') {
                    Some(ix) => (&body[..ix], &body[ix + 1..]),
                    None => (body, ""),
                };
                let payload = match results.as_bytes().first() {
                    None => None,
                    // `+download,{section=".text",...}` carries a bare value.
                    Some(b'{' | b'[') => Some(Parser::new(results).parse_bare_value()?),
                    Some(_) => Some(Value::Object(Parser::new(results).parse_result_list()?)),
                };
                let kind = match marker {
                    b'^' => RecordKind::Result,
                    b'+' => RecordKind::Status,
                    _ => RecordKind::Notify,
                };
                Self {
                    kind,
                    message: Some(class.to_string()),
                    payload,
                    token,
                    stream: Stream::Stdout,
                }
            }
        };
        Ok(Some(record))
    }
}

/// Repeated keys (`frame={..},frame={..}`) are folded into an array.
#[derive(Default)]
struct Results {
    map: Map<String, Value>,
    repeated: HashSet<String>,
}

impl Results {
    fn insert(&mut self, key: String, value: Value) {
        match self.map.get_mut(&key) {
            None => {
                self.map.insert(key, value);
            }
            Some(Value::Array(items)) if self.repeated.contains(&key) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
                self.repeated.insert(key);
            }
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, position: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.position).copied()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.position,
            text: self.text.to_string(),
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ParseError> {
        if self.peek() == Some(byte) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", byte as char)))
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        if self.position == self.text.len() {
            Ok(())
        } else {
            Err(self.error("trailing input"))
        }
    }

    fn parse_result_list(mut self) -> Result<Map<String, Value>, ParseError> {
        let mut results = Results::default();
        loop {
            let (key, value) = self.parse_result()?;
            results.insert(key, value);
            match self.peek() {
                Some(b',') => self.position += 1,
                None => break,
                Some(_) => return Err(self.error("expected `,`")),
            }
        }
        Ok(results.map)
    }

    fn parse_bare_value(mut self) -> Result<Value, ParseError> {
        let value = self.parse_value()?;
        self.finish()?;
        Ok(value)
    }

    fn parse_result(&mut self) -> Result<(String, Value), ParseError> {
        let start = self.position;
        while let Some(byte) = self.peek() {
            match byte {
                b'=' => break,
                b',' | b'{' | b'}' | b'[' | b']' | b'"' => {
                    return Err(self.error("expected `=`"));
                }
                _ => self.position += 1,
            }
        }
        let key = self.text[start..self.position].to_string();
        if key.is_empty() {
            return Err(self.error("expected a variable name"));
        }
        self.expect(b'=')?;
        Ok((key, self.parse_value()?))
    }

    fn parse_value(&mut self) -> Result<Value, ParseError> {
        match self.peek() {
            Some(b'"') => self.parse_c_string().map(Value::String),
            Some(b'{') => self.parse_tuple(),
            Some(b'[') => self.parse_list(),
            _ => Err(self.error("expected a value")),
        }
    }

    fn parse_tuple(&mut self) -> Result<Value, ParseError> {
        self.expect(b'{')?;
        let mut results = Results::default();
        if self.peek() == Some(b'}') {
            self.position += 1;
            return Ok(Value::Object(results.map));
        }
        loop {
            let (key, value) = self.parse_result()?;
            results.insert(key, value);
            match self.peek() {
                Some(b',') => self.position += 1,
                Some(b'}') => {
                    self.position += 1;
                    break;
                }
                _ => return Err(self.error("expected `,` or `}`")),
            }
        }
        Ok(Value::Object(results.map))
    }

    /// Lists hold either values or results; the keys of results are dropped.
    fn parse_list(&mut self) -> Result<Value, ParseError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.position += 1;
            return Ok(Value::Array(items));
        }
        loop {
            let item = match self.peek() {
                Some(b'"' | b'{' | b'[') => self.parse_value()?,
                _ => self.parse_result()?.1,
            };
            items.push(item);
            match self.peek() {
                Some(b',') => self.position += 1,
                Some(b']') => {
                    self.position += 1;
                    break;
                }
                _ => return Err(self.error("expected `,` or `]`")),
            }
        }
        Ok(Value::Array(items))
    }

    fn parse_c_string(&mut self) -> Result<String, ParseError> {
        self.expect(b'"')?;
        let mut bytes = Vec::new();
        loop {
            let Some(byte) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            self.position += 1;
            match byte {
                b'"' => break,
                b'\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error("unterminated escape"));
                    };
                    self.position += 1;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'e' => bytes.push(0x1b),
                        b'"' | b'\\' | b'\'' => bytes.push(escaped),
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(digit - b'0');
                                        self.position += 1;
                                    }
                                    _ => break,
                                }
                            }
                            bytes.push((value & 0xff) as u8);
                        }
                        other => bytes.extend([b'\\', other]),
                    }
                }
                other => bytes.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn parse(line: &str) -> Record {
        Record::parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn test_result_records() {
        let record = parse(
            r#"^done,bkpt={number="1",type="breakpoint",fullname="/src/main.c",line="12",thread-groups=["i1"]}"#,
        );
        assert_eq!(record.kind, RecordKind::Result);
        assert_eq!(record.message.as_deref(), Some("done"));
        assert_eq!(record.token, None);
        assert_eq!(
            record.payload,
            Some(json!({
                "bkpt": {
                    "number": "1",
                    "type": "breakpoint",
                    "fullname": "/src/main.c",
                    "line": "12",
                    "thread-groups": ["i1"],
                }
            }))
        );

        let record = parse("42^running\r\n");
        assert_eq!(record.token, Some(42));
        assert_eq!(record.message.as_deref(), Some("running"));
        assert_eq!(record.payload, None);

        let record = parse(r#"^error,msg="No symbol table is loaded.  Use the \"file\" command.""#);
        assert_eq!(
            record.payload,
            Some(json!({ "msg": "No symbol table is loaded.  Use the \"file\" command." }))
        );
    }

    #[test]
    fn test_async_and_stream_records() {
        let record = parse(r#"*stopped,reason="breakpoint-hit",frame={func="main",args=[]}"#);
        assert_eq!(record.kind, RecordKind::Notify);
        assert_eq!(record.message.as_deref(), Some("stopped"));
        assert_eq!(
            record.payload,
            Some(json!({ "reason": "breakpoint-hit", "frame": { "func": "main", "args": [] } }))
        );

        assert_eq!(parse("=thread-group-added,id=\"i1\"").kind, RecordKind::Notify);
        let download = parse(
            r#"+download,{section=".text",section-size="6668",total-size="9880"}"#,
        );
        assert_eq!(download.kind, RecordKind::Status);
        assert_eq!(download.message.as_deref(), Some("download"));
        assert_eq!(
            download.payload,
            Some(json!({ "section": ".text", "section-size": "6668", "total-size": "9880" }))
        );
        assert!(Record::parse_line("+download,{section=\".text\"},extra").is_err());

        let record = parse(r#"~"Breakpoint 1, main () at main.c:12\n""#);
        assert_eq!(record.kind, RecordKind::Console);
        assert_eq!(
            record.payload,
            Some(json!("Breakpoint 1, main () at main.c:12\n"))
        );
        assert_eq!(parse(r#"&"warning\t\101\n""#).payload, Some(json!("warning\tA\n")));
        assert_eq!(parse(r#"@"target says hi""#).kind, RecordKind::Target);
    }

    #[test]
    fn test_prompt_and_plain_output() {
        assert_eq!(Record::parse_line("(gdb) \n").unwrap(), None);
        assert_eq!(
            parse("Enter a number: 12"),
            Record::output("Enter a number: 12", Stream::Stdout)
        );
        assert_eq!(parse("123 apples"), Record::output("123 apples", Stream::Stdout));
    }

    #[test]
    fn test_lists_of_results_and_repeated_keys() {
        let record = parse(
            r#"^done,stack=[frame={level="0",func="f"},frame={level="1",func="main"}],a="1",a="2",a="3""#,
        );
        assert_eq!(
            record.payload,
            Some(json!({
                "stack": [
                    { "level": "0", "func": "f" },
                    { "level": "1", "func": "main" },
                ],
                "a": ["1", "2", "3"],
            }))
        );
    }

    #[test]
    fn test_malformed_records() {
        assert!(Record::parse_line(r#"^done,bkpt={number="1""#).is_err());
        assert!(Record::parse_line(r#"~"unterminated"#).is_err());
        assert!(Record::parse_line(r#"^done,="x""#).is_err());
        let error = Record::parse_line(r#"^done,value="1"junk"#).unwrap_err();
        assert_eq!(error.message, "expected `,`");
    }

    #[test]
    fn test_serializes_with_type_field() {
        let value = serde_json::to_value(Record::result("done", None)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "result",
                "message": "done",
                "payload": null,
                "token": null,
                "stream": "stdout",
            })
        );
    }
}
