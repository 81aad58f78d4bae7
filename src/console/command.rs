//! Console command grammar

use thiserror::Error;

use crate::mqtt::codec::PayloadMode;
use crate::mqtt::config::QoS;
use crate::mqtt::error::SessionError;

pub const HELP: &str = "\
Commands:
  connect [url]                          connect (optionally to another broker)
  disconnect                             close the connection
  sub <topic> [qos]                      add a subscription
  unsub <topic>                          remove a subscription
  pub [-q qos] [-r] [-m mode] [topic] <message>
                                         publish; mode is json|text|base64|hex
                                         `--` or a leading { or [ sends the rest
                                         of the line to the default topic
  history                                print the message log
  clear                                  empty the message log
  status                                 connection state and counters
  help                                   this text
  quit                                   disconnect and exit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0} (try `help`)")]
    Unknown(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishArgs {
    /// `None` means the configured default topic
    pub topic: Option<String>,
    pub message: String,
    pub qos: Option<QoS>,
    pub mode: Option<PayloadMode>,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { broker_url: Option<String> },
    Disconnect,
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish(PublishArgs),
    History,
    Clear,
    Status,
    Help,
    Quit,
}

/// Splits off the first whitespace-delimited token.
fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(char::is_whitespace) {
        Some(idx) => Some((&input[..idx], input[idx..].trim_start())),
        None => Some((input, "")),
    }
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let Some((name, rest)) = next_token(line) else {
        return Ok(None);
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "connect" => Command::Connect {
            broker_url: next_token(rest).map(|(url, _)| url.to_string()),
        },
        "disconnect" => Command::Disconnect,
        "sub" | "subscribe" => {
            let (topic, rest) =
                next_token(rest).ok_or(CommandError::MissingArgument("topic"))?;
            let qos = match next_token(rest) {
                Some((qos, _)) => qos
                    .parse::<QoS>()
                    .map_err(|e| CommandError::InvalidArgument(e.to_string()))?,
                None => QoS::default(),
            };
            Command::Subscribe {
                topic: topic.to_string(),
                qos,
            }
        }
        "unsub" | "unsubscribe" => {
            let (topic, _) = next_token(rest).ok_or(CommandError::MissingArgument("topic"))?;
            Command::Unsubscribe {
                topic: topic.to_string(),
            }
        }
        "pub" | "publish" => Command::Publish(parse_publish(rest)?),
        "history" => Command::History,
        "clear" => Command::Clear,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// `[-q qos] [-r] [-m mode] [--] [topic] <message>`
///
/// With two or more words after the flags, the first is the topic and the
/// remainder of the line, spacing intact, is the message. A single word is
/// the message for the default topic, and so is everything after `--` or a
/// line whose first word opens a JSON object or array.
fn parse_publish(mut rest: &str) -> Result<PublishArgs, CommandError> {
    let mut args = PublishArgs {
        topic: None,
        message: String::new(),
        qos: None,
        mode: None,
        retain: false,
    };

    while let Some((token, tail)) = next_token(rest) {
        match token {
            "--" => {
                args.message = tail.to_string();
                if args.message.is_empty() {
                    return Err(CommandError::MissingArgument("message"));
                }
                return Ok(args);
            }
            "-r" | "--retain" => args.retain = true,
            "-q" | "--qos" => {
                let (value, tail) = next_token(tail).ok_or(CommandError::MissingArgument("qos"))?;
                args.qos = Some(
                    value
                        .parse()
                        .map_err(|e: SessionError| {
                            CommandError::InvalidArgument(e.to_string())
                        })?,
                );
                rest = tail;
                continue;
            }
            "-m" | "--mode" => {
                let (value, tail) =
                    next_token(tail).ok_or(CommandError::MissingArgument("mode"))?;
                args.mode = Some(
                    value
                        .parse()
                        .map_err(|e: SessionError| {
                            CommandError::InvalidArgument(e.to_string())
                        })?,
                );
                rest = tail;
                continue;
            }
            _ => break,
        }
        rest = tail;
    }

    let (first, tail) = next_token(rest).ok_or(CommandError::MissingArgument("message"))?;
    if first.starts_with(['{', '[']) {
        args.message = rest.trim_start().to_string();
    } else if tail.is_empty() {
        args.message = first.to_string();
    } else {
        args.topic = Some(first.to_string());
        args.message = tail.to_string();
    }
    Ok(args)
}
