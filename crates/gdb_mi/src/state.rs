use serde_json::Value;

/// Where one thread's innermost frame is stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramCounter {
    pub path: String,
    pub line: u32,
    pub is_selected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointLocation {
    /// `1`, or `1.2` for one location of a multi-location breakpoint.
    pub number: String,
    pub path: String,
    pub line: u32,
}

/// Extracts every thread's location from a `-thread-info` result. Threads
/// that are running or stopped without line information are skipped.
pub fn program_counters(payload: &Value) -> Vec<ProgramCounter> {
    let current = payload.get("current-thread-id").and_then(Value::as_str);
    payload
        .get("threads")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|thread| {
            let frame = thread.get("frame")?;
            let (path, line) = source_position(frame)?;
            let id = thread.get("id").and_then(Value::as_str);
            Some(ProgramCounter {
                path,
                line,
                is_selected: id.is_some() && id == current,
            })
        })
        .collect()
}

/// Extracts breakpoint locations from a `-break-list` result. Pending
/// breakpoints and multi-location parents have no position and are skipped;
/// their locations are listed individually.
pub fn breakpoints(payload: &Value) -> Vec<BreakpointLocation> {
    let mut result = Vec::new();
    let body = payload
        .pointer("/BreakpointTable/body")
        .and_then(Value::as_array);
    for entry in body.into_iter().flatten() {
        result.extend(breakpoint_location(entry));
        let children = entry.get("locations").and_then(Value::as_array);
        result.extend(children.into_iter().flatten().filter_map(breakpoint_location));
    }
    result
}

fn breakpoint_location(entry: &Value) -> Option<BreakpointLocation> {
    let number = entry.get("number")?.as_str()?.to_string();
    let (path, line) = source_position(entry)?;
    Some(BreakpointLocation { number, path, line })
}

fn source_position(value: &Value) -> Option<(String, u32)> {
    let path = value
        .get("fullname")
        .or_else(|| value.get("file"))?
        .as_str()?;
    let line = value.get("line")?.as_str()?.parse().ok()?;
    Some((path.to_string(), line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use pretty_assertions::assert_eq;

    fn payload(line: &str) -> Value {
        Record::parse_line(line).unwrap().unwrap().payload.unwrap()
    }

    #[test]
    fn test_program_counters() {
        let payload = payload(concat!(
            r#"^done,threads=["#,
            r#"{id="2",target-id="Thread 0x7f",frame={level="0",func="worker",args=[],file="w.c",fullname="/src/w.c",line="40"},state="stopped"},"#,
            r#"{id="1",target-id="Thread 0x7e",frame={level="0",func="main",args=[],file="main.c",line="12"},state="stopped"},"#,
            r#"{id="3",target-id="Thread 0x7d",state="running"}"#,
            r#"],current-thread-id="1""#
        ));
        assert_eq!(
            program_counters(&payload),
            vec![
                ProgramCounter {
                    path: "/src/w.c".into(),
                    line: 40,
                    is_selected: false,
                },
                ProgramCounter {
                    path: "main.c".into(),
                    line: 12,
                    is_selected: true,
                },
            ]
        );
        assert_eq!(program_counters(&Value::Null), vec![]);
    }

    #[test]
    fn test_breakpoints() {
        let payload = payload(concat!(
            r#"^done,BreakpointTable={nr_rows="3",nr_cols="6",hdr=[{width="7",alignment="-1",col_name="number",colhdr="Num"}],body=["#,
            r#"bkpt={number="1",type="breakpoint",enabled="y",fullname="/src/main.c",line="10"},"#,
            r#"bkpt={number="2",type="breakpoint",addr="<PENDING>",pending="nowhere.c:3"},"#,
            r#"bkpt={number="3",type="breakpoint",addr="<MULTIPLE>",locations=["#,
            r#"{number="3.1",enabled="y",fullname="/src/a.h",line="7"},"#,
            r#"{number="3.2",enabled="y",fullname="/src/b.h",line="7"}]}"#,
            r#"]}"#
        ));
        let numbers: Vec<_> = breakpoints(&payload)
            .into_iter()
            .map(|location| (location.number, location.path, location.line))
            .collect();
        assert_eq!(
            numbers,
            vec![
                ("1".to_string(), "/src/main.c".to_string(), 10),
                ("3.1".to_string(), "/src/a.h".to_string(), 7),
                ("3.2".to_string(), "/src/b.h".to_string(), 7),
            ]
        );
    }
}
