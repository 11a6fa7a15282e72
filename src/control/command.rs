//! Control command documents and their descriptor
//!
//! A request is one JSON line:
//!
//! ```text
//! {"command": "claim", "args": {"lease-ms": 30000}}
//! ```
//!
//! The descriptor lists the commands the server accepts and the arguments each
//! takes. It can be loaded from a TOML file:
//!
//! ```toml
//! [[command]]
//! name = "submit"
//! description = "Queue a newly discovered URL"
//!
//! [[command.arg]]
//! name = "url"
//! kind = "string"
//! required = true
//! ```

use crate::control::ControlError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Type of a command argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgKind {
    String,
    Integer,
    Boolean,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    /// Returns true if `value` is of this kind
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One argument of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    #[serde(default)]
    pub required: bool,
}

/// One command the server accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "arg", default)]
    pub args: Vec<ArgSpec>,
}

impl CommandSpec {
    fn new(name: &str, description: &str, args: Vec<ArgSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            args,
        }
    }
}

fn arg(name: &str, kind: ArgKind, required: bool) -> ArgSpec {
    ArgSpec {
        name: name.to_string(),
        kind,
        required,
    }
}

/// The set of commands the control server accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    #[serde(rename = "command", default)]
    pub commands: Vec<CommandSpec>,
}

impl CommandDescriptor {
    /// The commands every site manager understands
    pub fn builtin() -> Self {
        Self {
            commands: vec![
                CommandSpec::new("ping", "Liveness check", vec![]),
                CommandSpec::new("status", "Manager state and queue lengths", vec![]),
                CommandSpec::new(
                    "claim",
                    "Claim the oldest todo task",
                    vec![arg("lease-ms", ArgKind::Integer, false)],
                ),
                CommandSpec::new(
                    "complete",
                    "Mark a claimed task done",
                    vec![arg("docid", ArgKind::Integer, true), arg("attempt", ArgKind::Integer, true)],
                ),
                CommandSpec::new(
                    "fail",
                    "Move a claimed task to failed",
                    vec![arg("docid", ArgKind::Integer, true), arg("attempt", ArgKind::Integer, true)],
                ),
                CommandSpec::new(
                    "submit",
                    "Queue a newly discovered URL",
                    vec![arg("url", ArgKind::String, true), arg("depth", ArgKind::Integer, false)],
                ),
                CommandSpec::new("backup", "Write a backup snapshot now", vec![]),
                CommandSpec::new("shutdown", "Stop the site manager", vec![]),
            ],
        }
    }

    /// Loads a descriptor from a TOML file
    pub fn load(path: &Path) -> Result<Self, ControlError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControlError::Descriptor(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parses a descriptor from TOML text
    pub fn parse(content: &str) -> Result<Self, ControlError> {
        let descriptor: CommandDescriptor =
            toml::from_str(content).map_err(|e| ControlError::Descriptor(e.to_string()))?;

        if descriptor.commands.is_empty() {
            return Err(ControlError::Descriptor(
                "descriptor declares no commands".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for command in &descriptor.commands {
            if command.name.trim().is_empty() {
                return Err(ControlError::Descriptor("command name cannot be empty".to_string()));
            }
            if !seen.insert(command.name.as_str()) {
                return Err(ControlError::Descriptor(format!(
                    "command '{}' declared twice",
                    command.name
                )));
            }

            let mut args = HashSet::new();
            for a in &command.args {
                if !args.insert(a.name.as_str()) {
                    return Err(ControlError::Descriptor(format!(
                        "argument '{}' of '{}' declared twice",
                        a.name, command.name
                    )));
                }
            }
        }

        Ok(descriptor)
    }

    /// Looks up a command by name
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Checks a request against the descriptor
    ///
    /// # Returns
    ///
    /// * `Ok(&CommandSpec)` - The matching command
    /// * `Err(ControlError)` - Unknown command, missing or unknown argument, or wrong kind
    pub fn validate(&self, request: &CommandDocument) -> Result<&CommandSpec, ControlError> {
        let spec = self
            .get(&request.command)
            .ok_or_else(|| ControlError::UnknownCommand(request.command.clone()))?;

        for a in &spec.args {
            match request.args.get(&a.name) {
                None | Some(Value::Null) if a.required => {
                    return Err(ControlError::MissingArgument {
                        command: spec.name.clone(),
                        arg: a.name.clone(),
                    });
                }
                Some(value) if !value.is_null() && !a.kind.accepts(value) => {
                    return Err(ControlError::WrongArgumentKind {
                        command: spec.name.clone(),
                        arg: a.name.clone(),
                        expected: a.kind,
                    });
                }
                _ => {}
            }
        }

        if let Some(unknown) = request
            .args
            .keys()
            .find(|name| !spec.args.iter().any(|a| &a.name == *name))
        {
            return Err(ControlError::UnknownArgument {
                command: spec.name.clone(),
                arg: unknown.clone(),
            });
        }

        Ok(spec)
    }
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A request read from a control connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDocument {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CommandDocument {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Map::new(),
        }
    }

    /// Adds an argument (builder style)
    pub fn with_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    pub fn u64_arg(&self, name: &str) -> Option<u64> {
        self.args.get(name).and_then(Value::as_u64)
    }

    /// Required integer argument
    pub fn require_u64(&self, name: &str) -> Result<u64, ControlError> {
        self.u64_arg(name).ok_or_else(|| ControlError::MissingArgument {
            command: self.command.clone(),
            arg: name.to_string(),
        })
    }

    /// Required string argument
    pub fn require_str(&self, name: &str) -> Result<&str, ControlError> {
        self.str_arg(name).ok_or_else(|| ControlError::MissingArgument {
            command: self.command.clone(),
            arg: name.to_string(),
        })
    }
}

/// A reply written back to a control connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl fmt::Display) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

/// Executes validated commands
///
/// Handlers run on the blocking pool, so they may touch the queues directly.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, request: &CommandDocument) -> Result<Value, ControlError>;
}
