pub const USAGE: &str = "\
usage:
  robochat chat [--robot NAME] [--topic ID] [--model PROVIDER/MODEL]... [--offline] PROMPT...
  robochat topics [--robot NAME]
  robochat history TOPIC_ID

Settings are read from the robochat directory under the user config dir.
Set RUST_LOG (for example RUST_LOG=robochat_core=debug) for diagnostics.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(ChatArgs),
    Topics { robot: Option<String> },
    History { topic: String },
    Help,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatArgs {
    pub robot: Option<String>,
    pub topic: Option<String>,
    /// Each one gets its own response, in order.
    pub models: Vec<String>,
    /// Answers with the scripted echo provider instead of the network.
    pub offline: bool,
    pub prompt: String,
}

/// Parses the arguments after the program name.
pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "chat" => parse_chat(args).map(Command::Chat),
        "topics" => {
            let mut robot = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--robot" => robot = Some(value_for("--robot", args.next())?),
                    other => return Err(format!("unexpected argument `{other}` for topics")),
                }
            }
            Ok(Command::Topics { robot })
        }
        "history" => {
            let topic = value_for("history", args.next())?;
            if let Some(extra) = args.next() {
                return Err(format!("unexpected argument `{extra}` for history"));
            }
            Ok(Command::History { topic })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command `{other}`")),
    }
}

fn parse_chat(mut args: impl Iterator<Item = String>) -> Result<ChatArgs, String> {
    let mut chat = ChatArgs::default();
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--robot" => chat.robot = Some(value_for("--robot", args.next())?),
            "--topic" => chat.topic = Some(value_for("--topic", args.next())?),
            "--model" => chat.models.push(value_for("--model", args.next())?),
            "--offline" => chat.offline = true,
            "--" => {
                words.extend(args.by_ref());
                break;
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag `{flag}`")),
            _ => words.push(arg),
        }
    }

    chat.prompt = words.join(" ").trim().to_string();
    if chat.prompt.is_empty() {
        return Err("chat needs a prompt".to_string());
    }
    Ok(chat)
}

fn value_for(flag: &str, value: Option<String>) -> Result<String, String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("`{flag}` needs a value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn chat_collects_flags_and_prompt_words() {
        let command = parse(args(&[
            "chat", "--robot", "coder", "--model", "openai/gpt-4o", "--offline", "why", "rust?",
        ]))
        .expect("chat parses");

        assert_eq!(
            command,
            Command::Chat(ChatArgs {
                robot: Some("coder".to_string()),
                topic: None,
                models: vec!["openai/gpt-4o".to_string()],
                offline: true,
                prompt: "why rust?".to_string(),
            })
        );
    }

    #[test]
    fn double_dash_keeps_flag_like_words() {
        let command = parse(args(&["chat", "--", "--offline", "is", "a", "flag"])).expect("parses");
        let Command::Chat(chat) = command else {
            panic!("expected chat");
        };
        assert!(!chat.offline);
        assert_eq!(chat.prompt, "--offline is a flag");
    }

    #[test]
    fn rejects_incomplete_invocations() {
        assert!(parse(args(&["chat"])).is_err());
        assert!(parse(args(&["chat", "--topic"])).is_err());
        assert!(parse(args(&["chat", "--verbose", "hi"])).is_err());
        assert!(parse(args(&["history"])).is_err());
        assert!(parse(args(&["launch"])).is_err());
        assert_eq!(parse(Vec::new()), Ok(Command::Help));
        assert_eq!(
            parse(args(&["topics", "--robot", "coder"])),
            Ok(Command::Topics {
                robot: Some("coder".to_string())
            })
        );
    }
}
