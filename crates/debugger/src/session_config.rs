use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{ser::PrettyFormatter, Map, Value};
use thiserror::Error;

const KEYS: [&str; 3] = ["variables", "modes", "breakpoints"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("the root object must be an associative array")]
    NotAnObject,
    #[error("invalid key '{0}'")]
    UnknownKey(String),
    #[error("\"{0}\" must be an associative array")]
    NotAMap(&'static str),
    #[error("invalid \"{key}\": {source}")]
    Invalid {
        key: &'static str,
        source: serde_json::Error,
    },
    #[error("at least one mode has to be defined")]
    NoModes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("undefined variable '{0}'")]
    Undefined(String),
    #[error("malformed template at byte {position}: {template}")]
    Malformed { template: String, position: usize },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown: Vec<String>,
    /// Keys the bridge does not use, kept so `show` writes them back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The contents of a session file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub variables: IndexMap<String, String>,
    pub modes: IndexMap<String, ModeConfig>,
    /// Kept as written; only the user edits it.
    pub breakpoints: Map<String, Value>,
}

impl SessionConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let Value::Object(mut root) = serde_json::from_str::<Value>(text)? else {
            return Err(ConfigError::NotAnObject);
        };
        if let Some(key) = root.keys().find(|key| !KEYS.contains(&key.as_str())) {
            return Err(ConfigError::UnknownKey(key.clone()));
        }
        for key in KEYS {
            match root.get(key) {
                None | Some(Value::Object(_)) => {}
                Some(_) => return Err(ConfigError::NotAMap(key)),
            }
        }

        let mut section =
            |key: &'static str| root.remove(key).unwrap_or_else(|| Value::Object(Map::new()));
        let variables =
            serde_json::from_value(section("variables")).map_err(|source| ConfigError::Invalid {
                key: "variables",
                source,
            })?;
        let modes: IndexMap<String, ModeConfig> = serde_json::from_value(section("modes"))
            .map_err(|source| ConfigError::Invalid {
                key: "modes",
                source,
            })?;
        let breakpoints = match section("breakpoints") {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let config = Self {
            variables,
            modes,
            breakpoints,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modes.is_empty() {
            return Err(ConfigError::NoModes);
        }
        Ok(())
    }

    /// The session created by `new`: an editing mode and a debugging mode.
    pub fn template() -> Self {
        let mut modes = IndexMap::new();
        modes.insert("code".to_string(), ModeConfig::default());
        modes.insert(
            "debug".to_string(),
            ModeConfig {
                setup: vec!["#source -v bps.gdb #note: commented out".into()],
                teardown: vec!["#save breakpoints bps.gdb".into()],
                ..Default::default()
            },
        );
        Self {
            modes,
            ..Default::default()
        }
    }

    /// The first declared mode, which is entered on load.
    pub fn first_mode(&self) -> Option<&str> {
        self.modes.keys().next().map(String::as_str)
    }

    /// Pretty JSON with four-space indentation, as written by `show`.
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        let mut bytes = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Replaces `{name}` in `template` with the variable's value. `{{` and `}}`
/// stand for literal braces.
pub fn substitute(
    template: &str,
    variables: &IndexMap<String, String>,
) -> Result<String, SubstitutionError> {
    let malformed = |position| SubstitutionError::Malformed {
        template: template.to_string(),
        position,
    };

    let mut output = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((position, c)) = chars.next() {
        match c {
            '{' if chars.next_if(|(_, c)| *c == '{').is_some() => output.push('{'),
            '}' if chars.next_if(|(_, c)| *c == '}').is_some() => output.push('}'),
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some((_, '}')) => break,
                        Some((_, '{')) | None => return Err(malformed(position)),
                        Some((_, c)) => name.push(c),
                    }
                }
                if name.is_empty() {
                    return Err(malformed(position));
                }
                let value = variables
                    .get(&name)
                    .ok_or(SubstitutionError::Undefined(name))?;
                output.push_str(value);
            }
            '}' => return Err(malformed(position)),
            c => output.push(c),
        }
    }
    Ok(output)
}
