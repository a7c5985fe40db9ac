use std::fmt::Display;

use handlebars::Handlebars;
use serde::Serialize;

/// One external command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "line", rename_all = "snake_case")]
pub enum Command {
    /// Split into words with POSIX shell quoting rules and launched directly,
    /// without a shell in between.
    Argv(String),
    /// Handed verbatim to `sh -c`.
    Shell(String),
}

impl Command {
    pub fn argv(line: impl Into<String>) -> Self {
        Command::Argv(line.into())
    }

    pub fn shell(line: impl Into<String>) -> Self {
        Command::Shell(line.into())
    }

    /// The command line as written.
    pub fn line(&self) -> &str {
        match self {
            Command::Argv(line) | Command::Shell(line) => line,
        }
    }

    /// Program and arguments to launch.
    pub fn program_args(&self) -> Result<Vec<String>, CommandParseError> {
        match self {
            Command::Argv(line) => {
                let words = shlex::split(line).ok_or_else(|| CommandParseError::Quoting(line.clone()))?;
                if words.is_empty() {
                    return Err(CommandParseError::Empty);
                }
                Ok(words)
            }
            Command::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(CommandParseError::Empty);
                }
                Ok(vec!["sh".to_string(), "-c".to_string(), line.clone()])
            }
        }
    }

    /// Renders the command line as a handlebars template, keeping the variant.
    pub fn instantiate(
        &self,
        handlebars: &mut Handlebars,
        args: impl Serialize,
    ) -> Result<Self, CommandInstantiationError> {
        let rendered = handlebars.render_template(self.line(), &args)?;
        Ok(match self {
            Command::Argv(_) => Command::Argv(rendered),
            Command::Shell(_) => Command::Shell(rendered),
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.line())
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Command::Argv(line.to_string())
    }
}

impl From<String> for Command {
    fn from(line: String) -> Self {
        Command::Argv(line)
    }
}

impl From<&String> for Command {
    fn from(line: &String) -> Self {
        Command::Argv(line.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unbalanced quoting in command: {0}")]
    Quoting(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommandInstantiationError {
    #[error("Failed to render command template: {0}")]
    Render(#[from] handlebars::RenderError),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn argv_splits_like_a_shell() {
        let cmd = Command::from("zip -r 'my archive.zip' dir");
        assert_eq!(cmd.program_args().unwrap(), vec!["zip", "-r", "my archive.zip", "dir"]);
    }

    #[test]
    fn shell_goes_through_sh() {
        let cmd = Command::shell("echo a && echo b");
        assert_eq!(cmd.program_args().unwrap(), vec!["sh", "-c", "echo a && echo b"]);
    }

    #[test]
    fn bad_command_lines() {
        assert_eq!(Command::argv("   ").program_args(), Err(CommandParseError::Empty));
        assert_eq!(Command::shell("").program_args(), Err(CommandParseError::Empty));
        assert!(matches!(Command::argv("echo 'oops").program_args(), Err(CommandParseError::Quoting(_))));
    }

    #[test]
    fn instantiate_keeps_the_variant() {
        let mut handlebars = Handlebars::new();
        let cmd = Command::shell("gzip {{input}}")
            .instantiate(&mut handlebars, json!({ "input": "a.txt" }))
            .unwrap();
        assert_eq!(cmd, Command::shell("gzip a.txt"));

        let cmd = Command::argv("cp {{input}} out/{{index}}")
            .instantiate(&mut handlebars, json!({ "input": "b", "index": 2 }))
            .unwrap();
        assert_eq!(cmd, Command::argv("cp b out/2"));
    }

    #[test]
    fn display_is_the_line() {
        assert_eq!(Command::shell("ls -l").to_string(), "ls -l");
    }
}
