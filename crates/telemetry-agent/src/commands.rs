//! Console commands
//!
//! One command per stdin line, e.g. `set temperature 215` or `disable sensor_*`.

use serde_json::json;
use wildmatch::WildMatch;

use telemetry::{PropertyKind, PropertyValue, Telemetry};

use crate::console::ConsoleSession;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `set <property> <int>`
    Set { name: String, value: i32 },
    /// `sets <property> <text...>`
    SetText { name: String, text: String },
    /// `notify <notification> <level> <value>`
    Notify { name: String, level: u8, value: i32 },
    /// `disable <glob>`
    Disable(String),
    /// `enable <glob>`
    Enable(String),
    Connect,
    Disconnect,
    /// `show <name>`
    Show(String),
    Help,
}

const HELP: &str = "\
set <property> <int>
sets <property> <text>
notify <notification> <level> <value>
disable <glob> | enable <glob>
connect | disconnect
show <name>";

impl Command {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Result<Self, CommandError>> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None if line.is_empty() => return None,
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let command = match verb {
            "set" => match args.as_slice() {
                [name, value] => parse_number(value).map(|value| Command::Set {
                    name: name.to_string(),
                    value,
                }),
                _ => Err(CommandError::Usage("set <property> <int>")),
            },
            "sets" => match rest.split_once(char::is_whitespace) {
                Some((name, text)) => Ok(Command::SetText {
                    name: name.to_string(),
                    text: text.trim_start().to_string(),
                }),
                None if !rest.is_empty() => Ok(Command::SetText {
                    name: rest.to_string(),
                    text: String::new(),
                }),
                None => Err(CommandError::Usage("sets <property> <text>")),
            },
            "notify" => match args.as_slice() {
                [name, level, value] => level
                    .parse::<u8>()
                    .map_err(|_| CommandError::InvalidNumber(level.to_string()))
                    .and_then(|level| {
                        Ok(Command::Notify {
                            name: name.to_string(),
                            level,
                            value: parse_number(value)?,
                        })
                    }),
                _ => Err(CommandError::Usage("notify <notification> <level> <value>")),
            },
            "disable" | "enable" => match args.as_slice() {
                [pattern] if verb == "disable" => Ok(Command::Disable(pattern.to_string())),
                [pattern] => Ok(Command::Enable(pattern.to_string())),
                _ => Err(CommandError::Usage("disable|enable <glob>")),
            },
            "connect" => Ok(Command::Connect),
            "disconnect" => Ok(Command::Disconnect),
            "show" => match args.as_slice() {
                [name] => Ok(Command::Show(name.to_string())),
                _ => Err(CommandError::Usage("show <name>")),
            },
            "help" | "?" => Ok(Command::Help),
            other => Err(CommandError::Unknown(other.to_string())),
        };
        Some(command)
    }

    /// Run against the live telemetry state and describe the outcome
    pub fn execute(&self, telemetry: &Telemetry, session: &ConsoleSession) -> String {
        match self {
            Command::Set { name, value } => match telemetry.find_property(name) {
                Some(id) if telemetry.update_property(id, *value) => format!("{} = {}", name, value),
                Some(_) => format!("{} unchanged", name),
                None => format!("No property '{}'", name),
            },
            Command::SetText { name, text } => match telemetry.find_property(name) {
                Some(id) if telemetry.update_string_property(id, text) => {
                    let stored = telemetry.property_string_value(id).unwrap_or_default();
                    format!("{} = \"{}\"", name, stored)
                }
                Some(_) => format!("{} unchanged", name),
                None => format!("No property '{}'", name),
            },
            Command::Notify { name, level, value } => match telemetry.find_notification(name) {
                Some(id) => {
                    telemetry.update_notification(id, *level, *value);
                    format!("{} level {} value {}", name, level, value)
                }
                None => format!("No notification '{}'", name),
            },
            Command::Disable(pattern) => {
                let count = set_disabled_matching(telemetry, pattern, true);
                format!("Disabled {} properties", count)
            }
            Command::Enable(pattern) => {
                let count = set_disabled_matching(telemetry, pattern, false);
                format!("Enabled {} properties", count)
            }
            Command::Connect => {
                session.set_connected(true);
                "Connected".to_string()
            }
            Command::Disconnect => {
                session.set_connected(false);
                "Disconnected".to_string()
            }
            Command::Show(name) => show(telemetry, name),
            Command::Help => HELP.to_string(),
        }
    }
}

fn parse_number(text: &str) -> Result<i32, CommandError> {
    text.parse()
        .map_err(|_| CommandError::InvalidNumber(text.to_string()))
}

/// Returns how many properties matched `pattern`
fn set_disabled_matching(telemetry: &Telemetry, pattern: &str, disabled: bool) -> usize {
    let matcher = WildMatch::new(pattern);
    telemetry
        .properties()
        .ids()
        .into_iter()
        .filter(|id| matcher.matches(&telemetry.property_key(*id)))
        .filter(|id| telemetry.set_property_disabled(*id, disabled))
        .count()
}

fn show(telemetry: &Telemetry, name: &str) -> String {
    if let Some(snap) = telemetry
        .find_property(name)
        .and_then(|id| telemetry.property_snapshot(id))
    {
        let kind = match snap.kind {
            PropertyKind::Numeric(format) => json!({
                "scale": format.scale,
                "decimals": format.decimals,
                "signed": format.signed,
            }),
            PropertyKind::Text { max_len } => json!({ "max_len": max_len }),
        };
        return json!({
            "property": snap.key,
            "id": snap.id,
            "kind": kind,
            "value": value_json(&snap.value),
            "last_published": value_json(&snap.last_published),
            "changed": snap.changed,
            "debouncing": snap.debouncing,
            "debounce_ms": snap.debounce_delay_ms,
            "disabled": snap.disabled,
        })
        .to_string();
    }

    if let Some(snap) = telemetry
        .find_notification(name)
        .and_then(|id| telemetry.notification_snapshot(id))
    {
        return json!({
            "notification": snap.key,
            "id": snap.id,
            "channel": snap.channel,
            "template": snap.template,
            "level": snap.level,
            "value": snap.value,
            "changed": snap.changed,
            "value_map": snap.value_map,
        })
        .to_string();
    }

    format!("Nothing named '{}'", name)
}

fn value_json(value: &PropertyValue) -> serde_json::Value {
    match value {
        PropertyValue::Number(n) => json!(n),
        PropertyValue::Text(text) => json!(text),
    }
}
