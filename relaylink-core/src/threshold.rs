/**
 * THRESHOLD POLICY - Coupure automatique du relais sur niveau batterie
 *
 * ROLE : décide, pour chaque lecture batterie, si un TURN_OFF doit partir.
 * Le seuil (1..=100, défaut 100) est la seule donnée mutable partagée entre
 * le chemin télémétrie et le chemin utilisateur : un seul mutex la protège.
 *
 * `evaluate` est pure et "level-triggered" : tant que la lecture reste au-dessus
 * du seuil, chaque lecture produit une commande. `ShutoffGate` permet le mode
 * "edge" (une commande par franchissement) si la config le demande.
 */

use crate::command::Command;
use crate::error::ValidationError;
use crate::telemetry::TelemetryReading;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_THRESHOLD: u8 = 100;
pub const MIN_THRESHOLD: u8 = 1;
pub const MAX_THRESHOLD: u8 = 100;

/// Returns `TURN_OFF` on `control_topic` iff the reading is at or above the threshold
pub fn evaluate(reading: &TelemetryReading, threshold: u8, control_topic: &str) -> Option<Command> {
    (reading.percentage() >= f32::from(threshold)).then(|| Command::turn_off(control_topic))
}

/// Parse une saisie utilisateur de seuil ("50", " 80 ")
pub fn parse_threshold(input: &str) -> Result<u8, ValidationError> {
    let trimmed = input.trim();
    let value: i64 = trimmed
        .parse()
        .map_err(|_| ValidationError::NotANumber(trimmed.to_string()))?;
    check_range(value)
}

fn check_range(value: i64) -> Result<u8, ValidationError> {
    if (i64::from(MIN_THRESHOLD)..=i64::from(MAX_THRESHOLD)).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ValidationError::ThresholdOutOfRange(value))
    }
}

/// Process-wide shutoff percentage. Cloning shares the same value.
#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    value: Arc<Mutex<u8>>,
}

impl ThresholdConfig {
    pub fn new(initial: u8) -> Result<Self, ValidationError> {
        let value = check_range(i64::from(initial))?;
        Ok(Self { value: Arc::new(Mutex::new(value)) })
    }

    pub fn get(&self) -> u8 {
        *self.value.lock()
    }

    /// Validates then stores; the previous value is kept on error.
    pub fn set_threshold(&self, input: &str) -> Result<u8, ValidationError> {
        let value = parse_threshold(input)?;
        *self.value.lock() = value;
        Ok(value)
    }

    /// Évalue la politique avec le seuil courant (lecture unique sous le verrou)
    pub fn evaluate(&self, reading: &TelemetryReading, control_topic: &str) -> Option<Command> {
        evaluate(reading, self.get(), control_topic)
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self { value: Arc::new(Mutex::new(DEFAULT_THRESHOLD)) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Every reading at or above the threshold fires
    #[default]
    Level,
    /// Fires once per upward crossing, re-armed by a reading below the threshold
    Edge,
}

/// Filters the policy output according to the trigger mode
#[derive(Debug, Clone)]
pub struct ShutoffGate {
    mode: TriggerMode,
    armed: bool,
    last_threshold: Option<u8>,
}

impl ShutoffGate {
    pub fn new(mode: TriggerMode) -> Self {
        Self {
            mode,
            armed: true,
            last_threshold: None,
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn filter(&mut self, threshold: u8, decision: Option<Command>) -> Option<Command> {
        if self.mode == TriggerMode::Level {
            return decision;
        }

        // un nouveau seuil réarme la coupure
        if self.last_threshold != Some(threshold) {
            self.last_threshold = Some(threshold);
            self.armed = true;
        }

        match decision {
            Some(command) if self.armed => {
                self.armed = false;
                Some(command)
            }
            Some(_) => None,
            None => {
                self.armed = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(level: i32) -> TelemetryReading {
        TelemetryReading::new(level, 100).unwrap()
    }

    #[test]
    fn test_fires_iff_percentage_at_or_above_threshold() {
        for threshold in [1u8, 50, 80, 100] {
            for level in 0..=100 {
                let fired = evaluate(&reading(level), threshold, "c").is_some();
                assert_eq!(fired, level >= i32::from(threshold), "level {level} threshold {threshold}");
            }
        }
    }

    #[test]
    fn test_shutoff_command_targets_control_topic() {
        let cmd = evaluate(&reading(90), 80, "esp/relay/control").unwrap();
        assert_eq!(cmd.topic(), "esp/relay/control");
        assert_eq!(cmd.payload(), "TURN_OFF");
    }

    #[test]
    fn test_default_threshold_only_fires_at_full_charge() {
        let config = ThresholdConfig::default();
        assert_eq!(config.get(), 100);
        assert!(config.evaluate(&reading(99), "c").is_none());
        assert!(config.evaluate(&reading(100), "c").is_some());
    }

    #[test]
    fn test_set_threshold_rejects_bad_input() {
        let config = ThresholdConfig::default();
        assert_eq!(config.set_threshold("0"), Err(ValidationError::ThresholdOutOfRange(0)));
        assert_eq!(config.set_threshold("101"), Err(ValidationError::ThresholdOutOfRange(101)));
        assert_eq!(config.set_threshold("abc"), Err(ValidationError::NotANumber("abc".into())));
        assert_eq!(config.set_threshold(""), Err(ValidationError::NotANumber(String::new())));
        assert_eq!(config.get(), 100);
    }

    #[test]
    fn test_set_threshold_applies_to_later_evaluations() {
        let config = ThresholdConfig::default();
        assert_eq!(config.set_threshold(" 50 "), Ok(50));

        let shared = config.clone();
        assert_eq!(shared.get(), 50);
        assert!(shared.evaluate(&reading(49), "c").is_none());
        assert!(shared.evaluate(&reading(50), "c").is_some());
    }

    #[test]
    fn test_threshold_80_scenario() {
        let config = ThresholdConfig::new(80).unwrap();
        assert!(config.evaluate(&reading(79), "c").is_none());
        let fired: Vec<_> = [reading(80)]
            .iter()
            .filter_map(|r| config.evaluate(r, "c"))
            .collect();
        assert_eq!(fired, vec![Command::turn_off("c")]);
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(ThresholdConfig::new(0).is_err());
        assert!(ThresholdConfig::new(101).is_err());
    }

    #[test]
    fn test_level_gate_repeats() {
        let mut gate = ShutoffGate::new(TriggerMode::Level);
        for _ in 0..3 {
            assert!(gate.filter(80, evaluate(&reading(90), 80, "c")).is_some());
        }
    }

    #[test]
    fn test_edge_gate_fires_once_per_crossing() {
        let mut gate = ShutoffGate::new(TriggerMode::Edge);
        let mut run = |level| gate.filter(80, evaluate(&reading(level), 80, "c")).is_some();

        assert!(run(85));
        assert!(!run(90));
        assert!(!run(95));
        assert!(!run(70));
        assert!(run(81));
    }

    #[test]
    fn test_edge_gate_rearmed_by_threshold_change() {
        let mut gate = ShutoffGate::new(TriggerMode::Edge);
        assert!(gate.filter(80, evaluate(&reading(90), 80, "c")).is_some());
        assert!(gate.filter(80, evaluate(&reading(90), 80, "c")).is_none());
        assert!(gate.filter(60, evaluate(&reading(90), 60, "c")).is_some());
    }
}
