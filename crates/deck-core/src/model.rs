use serde::{Deserialize, Serialize};
use std::fmt;

/// Context id of the top-level screen. The synthesized back command targets it.
pub const ROOT_CONTEXT: &str = "main";
pub const BACK_COMMAND_ID: &str = "back";
pub const BACK_COMMAND_ICON: &str = "arrow-back-outline";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    #[default]
    Action,
    Context,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Action => "action",
            CommandKind::Context => "context",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A button on the deck. Field names on the wire match the config file keys;
/// `main` is config-only and never sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Command {
    #[serde(default, rename = "uuid")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "app")]
    pub application_target: String,
    #[serde(default, rename = "action")]
    pub action_line: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, rename = "type")]
    pub kind: CommandKind,
    #[serde(default, rename = "context")]
    pub context_id: String,
    #[serde(default, rename = "main", skip_serializing)]
    pub is_root: bool,
}

impl Command {
    /// The navigation entry prepended to every non-root context listing.
    pub fn back() -> Self {
        Self {
            id: BACK_COMMAND_ID.to_string(),
            icon: BACK_COMMAND_ICON.to_string(),
            kind: CommandKind::Context,
            context_id: ROOT_CONTEXT.to_string(),
            ..Self::default()
        }
    }

    pub fn is_action(&self) -> bool {
        self.kind == CommandKind::Action
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Layout {
    #[serde(default)]
    pub columns: u64,
    #[serde(
        default,
        rename(serialize = "backgroundColor", deserialize = "background_color")
    )]
    pub background_color: String,
    #[serde(default, rename(serialize = "buttonSize", deserialize = "button_size"))]
    pub button_size: u64,
}

/// One committed configuration. Never mutated after construction; a reload
/// builds a new one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub generation: u64,
    pub commands: Vec<Command>,
    pub layout: Layout,
}

impl Snapshot {
    pub fn new(commands: Vec<Command>, layout: Layout) -> Self {
        Self {
            generation: 0,
            commands,
            layout,
        }
    }

    pub fn root_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter(|command| command.is_root)
            .cloned()
            .collect()
    }

    /// Back command followed by the non-root commands of `context`, in file order.
    pub fn context_commands(&self, context: &str) -> Vec<Command> {
        let mut commands = vec![Command::back()];
        commands.extend(
            self.commands
                .iter()
                .filter(|command| !command.is_root && command.context_id == context)
                .cloned(),
        );
        commands
    }

    pub fn find(&self, context: &str, id: &str) -> Option<&Command> {
        self.commands
            .iter()
            .find(|command| command.context_id == context && command.id == id)
    }
}
