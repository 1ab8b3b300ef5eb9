//! Panel command line: one command per stdin line.

use std::fmt;

pub const HELP: &str = "\
commands:
  on                        send TURN_ON
  off                       send TURN_OFF
  timer <duration>          send TIMER:<duration>
  threshold <1..100>        set the automatic shutoff level
  battery <level> <scale>   inject a battery reading
  connect                   connect again after the link was lost
  status                    show connection state and threshold
  help                      this text
  quit                      disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCommand {
    On,
    Off,
    /// Raw text after `timer`, possibly empty: the controller reports a missing duration
    Timer(String),
    Threshold(String),
    Battery { level: i32, scale: i32 },
    Connect,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Unknown(String),
    Usage(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::Unknown(word) => write!(f, "unknown command '{word}', type 'help'"),
            ParseError::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

impl std::str::FromStr for PanelCommand {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "" => Err(ParseError::Empty),
            "on" => Ok(PanelCommand::On),
            "off" => Ok(PanelCommand::Off),
            "timer" => Ok(PanelCommand::Timer(rest.to_string())),
            "threshold" => Ok(PanelCommand::Threshold(rest.to_string())),
            "battery" => parse_battery(rest),
            "connect" => Ok(PanelCommand::Connect),
            "status" => Ok(PanelCommand::Status),
            "help" | "?" => Ok(PanelCommand::Help),
            "quit" | "exit" => Ok(PanelCommand::Quit),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

fn parse_battery(args: &str) -> Result<PanelCommand, ParseError> {
    const USAGE: &str = "battery <level> <scale>";
    let mut parts = args.split_whitespace();
    let (Some(level), Some(scale), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ParseError::Usage(USAGE));
    };
    match (level.parse(), scale.parse()) {
        (Ok(level), Ok(scale)) => Ok(PanelCommand::Battery { level, scale }),
        _ => Err(ParseError::Usage(USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("on".parse(), Ok(PanelCommand::On));
        assert_eq!("  OFF ".parse(), Ok(PanelCommand::Off));
        assert_eq!("timer 30".parse(), Ok(PanelCommand::Timer("30".into())));
        assert_eq!("timer".parse(), Ok(PanelCommand::Timer(String::new())));
        assert_eq!("threshold 80".parse(), Ok(PanelCommand::Threshold("80".into())));
        assert_eq!(
            "battery 80 100".parse(),
            Ok(PanelCommand::Battery { level: 80, scale: 100 })
        );
        assert_eq!("exit".parse(), Ok(PanelCommand::Quit));
        assert_eq!("connect".parse(), Ok(PanelCommand::Connect));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<PanelCommand>(), Err(ParseError::Empty));
        assert!(matches!("jump".parse::<PanelCommand>(), Err(ParseError::Unknown(_))));
        assert!(matches!("battery 80".parse::<PanelCommand>(), Err(ParseError::Usage(_))));
        assert!(matches!("battery a b".parse::<PanelCommand>(), Err(ParseError::Usage(_))));
        assert!(matches!("battery 1 2 3".parse::<PanelCommand>(), Err(ParseError::Usage(_))));
    }
}
