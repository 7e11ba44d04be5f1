//! Slash-command classification. Every inbound chat message is classified exactly once;
//! anything that is not a recognised command is plain user text.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    UserText(String),
    Model(ModelCommand),
    System(SystemCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelCommand {
    List,
    Browse(Option<String>),
    Pull(String),
    Delete(String),
    Search(String),
    Help,
    /// Action given without its required argument; holds the usage line.
    Usage(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCommand {
    Stop,
    /// Ask for a fresh reply to the latest user message.
    Regenerate,
    Exit,
    New,
    Sessions,
    Help,
}

pub fn classify(text: &str) -> Input {
    let trimmed = text.trim();
    let mut parts = trimmed.split_whitespace();
    let head = parts.next().unwrap_or_default().to_ascii_lowercase();
    match head.as_str() {
        "/models" => Input::Model(model_command(parts)),
        "/stop" => Input::System(SystemCommand::Stop),
        "/regenerate" => Input::System(SystemCommand::Regenerate),
        "/exit" | "/quit" => Input::System(SystemCommand::Exit),
        "/new" => Input::System(SystemCommand::New),
        "/sessions" => Input::System(SystemCommand::Sessions),
        "/system" => Input::System(SystemCommand::Help),
        _ => Input::UserText(text.to_string()),
    }
}

fn model_command<'a>(mut parts: impl Iterator<Item = &'a str>) -> ModelCommand {
    let action = match parts.next() {
        Some(a) => a.to_ascii_lowercase(),
        None => return ModelCommand::Help,
    };
    let arg = parts.next().map(|s| s.trim_matches('"').to_string());
    match (action.as_str(), arg) {
        ("list", _) => ModelCommand::List,
        ("browse", pattern) => ModelCommand::Browse(pattern),
        ("pull", Some(name)) => ModelCommand::Pull(name),
        ("pull", None) => ModelCommand::Usage("/models pull <model_name>"),
        ("delete", Some(name)) => ModelCommand::Delete(name),
        ("delete", None) => ModelCommand::Usage("/models delete <model_name>"),
        ("search", Some(pattern)) => ModelCommand::Search(pattern),
        ("search", None) => ModelCommand::Usage("/models search <pattern>"),
        _ => ModelCommand::Help,
    }
}

pub const MODELS_HELP: &str = "## Model commands

| Command | What it does |
|---|---|
| `/models list` | List local models |
| `/models browse [filter]` | Browse pullable models |
| `/models pull <model_name>` | Download a model |
| `/models delete <model_name>` | Remove a local model |
| `/models search <pattern>` | Search local and pullable models (regex) |
| `/models help` | Show this help |

Examples: `/models browse llama`, `/models pull llama3`, `/models search \"llama.*3\"`.
Large models can take several minutes to pull.";

pub const SYSTEM_HELP: &str = "## Session commands

| Command | What it does |
|---|---|
| `/stop` | Stop the reply being generated |
| `/regenerate` | Generate another reply to your last message |
| `/new` | Start a fresh session |
| `/sessions` | List saved sessions |
| `/exit`, `/quit` | Close this session |
| `/system help` | Show this help |";
