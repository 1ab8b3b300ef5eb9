//! Outbound relay commands.
//!
//! The relay firmware understands three payloads on its control topic:
//! `TURN_ON`, `TURN_OFF` and `TIMER:<duration>`. Anything else built with
//! [`Command::raw`] is forwarded untouched; rejecting it is the device's job.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TURN_ON: &str = "TURN_ON";
pub const TURN_OFF: &str = "TURN_OFF";
pub const TIMER_PREFIX: &str = "TIMER:";

/// How the timer duration typed by the user is checked before it is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPolicy {
    /// Any non-blank string goes out as-is (`TIMER:1h30` included)
    #[default]
    Verbatim,
    /// Only a positive integer number of seconds is accepted
    Seconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    topic: String,
    payload: String,
}

impl Command {
    pub fn turn_on(topic: impl Into<String>) -> Self {
        Self::raw(topic, TURN_ON)
    }

    pub fn turn_off(topic: impl Into<String>) -> Self {
        Self::raw(topic, TURN_OFF)
    }

    /// Builds `TIMER:<duration>`. A blank duration is always refused.
    pub fn timer(
        topic: impl Into<String>,
        duration: &str,
        policy: TimerPolicy,
    ) -> Result<Self, ValidationError> {
        let duration = duration.trim();
        if duration.is_empty() {
            return Err(ValidationError::EmptyTimer);
        }
        if policy == TimerPolicy::Seconds {
            match duration.parse::<u64>() {
                Ok(secs) if secs > 0 => {}
                _ => return Err(ValidationError::InvalidTimer(duration.to_string())),
            }
        }
        Ok(Self::raw(topic, format!("{TIMER_PREFIX}{duration}")))
    }

    /// Arbitrary payload, passed through without inspection
    pub fn raw(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn is_shutoff(&self) -> bool {
        self.payload == TURN_OFF
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.payload, self.topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_vocabulary() {
        assert_eq!(Command::turn_on("esp/relay/control").payload(), "TURN_ON");
        assert_eq!(Command::turn_off("esp/relay/control").payload(), "TURN_OFF");
        assert!(Command::turn_off("t").is_shutoff());
        assert!(!Command::turn_on("t").is_shutoff());
    }

    #[test]
    fn test_timer_verbatim_forwards_anything_non_blank() {
        let cmd = Command::timer("control", "30", TimerPolicy::Verbatim).unwrap();
        assert_eq!(cmd.payload(), "TIMER:30");
        assert_eq!(cmd.topic(), "control");

        let cmd = Command::timer("control", " 1h30 ", TimerPolicy::Verbatim).unwrap();
        assert_eq!(cmd.payload(), "TIMER:1h30");
    }

    #[test]
    fn test_timer_rejects_blank() {
        assert_eq!(
            Command::timer("control", "   ", TimerPolicy::Verbatim),
            Err(ValidationError::EmptyTimer)
        );
        assert_eq!(
            Command::timer("control", "", TimerPolicy::Seconds),
            Err(ValidationError::EmptyTimer)
        );
    }

    #[test]
    fn test_timer_seconds_policy() {
        assert!(Command::timer("c", "45", TimerPolicy::Seconds).is_ok());
        for bad in ["0", "-5", "abc", "1.5"] {
            assert_eq!(
                Command::timer("c", bad, TimerPolicy::Seconds),
                Err(ValidationError::InvalidTimer(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_timer_policy_serde_names() {
        let p: TimerPolicy = serde_yaml::from_str("seconds").unwrap();
        assert_eq!(p, TimerPolicy::Seconds);
        let p: TimerPolicy = serde_yaml::from_str("verbatim").unwrap();
        assert_eq!(p, TimerPolicy::Verbatim);
    }
}
