//! The four actuator states, mirrored between the local cache and the store.
//! Every engine changes actuators through this type.
//!
//! Mutations update the local cache immediately and queue one independent
//! store write per actuator; pushes from the store (another client toggling a
//! motor, our own echoes) land through [`ActuatorMirror::mirror`].

use serde_json::Value;

use crate::mode::Mode;
use crate::snapshot::SensorSnapshot;
use crate::store::keys;
use crate::writer::WriteQueue;

/// Number of pumps/valves on the rig.
pub const ACTUATORS: usize = 4;

pub struct ActuatorMirror {
    states: [bool; ACTUATORS],
    writer: WriteQueue,
}

impl ActuatorMirror {
    pub fn new(writer: WriteQueue) -> Self {
        Self {
            states: [false; ACTUATORS],
            writer,
        }
    }

    pub fn states(&self) -> [bool; ACTUATORS] {
        self.states
    }

    /// Flip actuator `index`. Only honoured in Manual mode; returns the new
    /// state, or `None` when ignored.
    pub fn toggle(&mut self, index: usize, mode: Mode) -> Option<bool> {
        if mode != Mode::Manual || index >= ACTUATORS {
            return None;
        }
        let on = !self.states[index];
        self.states[index] = on;
        self.writer.submit(keys::MOTORS[index], on);
        Some(on)
    }

    /// Set every actuator and write all four. Returns the indices whose local
    /// state changed.
    pub fn set_all(&mut self, desired: [bool; ACTUATORS]) -> Vec<usize> {
        let changed = self.changed(&desired);
        self.states = desired;
        for (key, on) in keys::MOTORS.into_iter().zip(desired) {
            self.writer.submit(key, on);
        }
        changed
    }

    /// Set every actuator, writing only those that changed.
    pub fn converge(&mut self, desired: [bool; ACTUATORS]) -> Vec<usize> {
        let changed = self.changed(&desired);
        for &i in &changed {
            self.states[i] = desired[i];
            self.writer.submit(keys::MOTORS[i], desired[i]);
        }
        changed
    }

    /// Activation pulse: actuator `i` on iff its last known moisture is
    /// below `low`; everything else off.
    pub fn evaluate_and_activate(&mut self, snapshot: &SensorSnapshot, low: f64) -> Vec<usize> {
        let desired = std::array::from_fn(|i| snapshot.moisture[i].is_some_and(|m| m < low));
        self.set_all(desired)
    }

    pub fn all_off(&mut self) -> Vec<usize> {
        self.set_all([false; ACTUATORS])
    }

    /// Adopt a value pushed from the store. Returns whether the local state
    /// changed, or `None` for non-boolean values and unknown indices.
    pub fn mirror(&mut self, index: usize, value: &Value) -> Option<bool> {
        let on = crate::store::as_bool(value)?;
        let slot = self.states.get_mut(index)?;
        let changed = *slot != on;
        *slot = on;
        Some(changed)
    }

    fn changed(&self, desired: &[bool; ACTUATORS]) -> Vec<usize> {
        (0..ACTUATORS)
            .filter(|&i| self.states[i] != desired[i])
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn mirror() -> (ActuatorMirror, WriteQueue, MemoryStore) {
        let store = MemoryStore::new();
        let (writer, _) = WriteQueue::spawn(store.clone(), Duration::from_secs(1));
        (ActuatorMirror::new(writer.clone()), writer, store)
    }

    fn snapshot(moisture: [Option<f64>; ACTUATORS]) -> SensorSnapshot {
        SensorSnapshot {
            moisture,
            ..SensorSnapshot::default()
        }
    }

    #[tokio::test]
    async fn starts_all_off() {
        let (m, _, _) = mirror();
        assert_eq!(m.states(), [false; ACTUATORS]);
    }

    #[tokio::test]
    async fn toggle_in_manual_flips_and_writes() {
        let (mut m, writer, store) = mirror();
        assert_eq!(m.toggle(1, Mode::Manual), Some(true));
        assert_eq!(m.toggle(1, Mode::Manual), Some(false));
        writer.flush().await;

        assert_eq!(store.writes_to("motor_2"), vec![json!(true), json!(false)]);
    }

    #[tokio::test]
    async fn toggle_outside_manual_is_a_no_op() {
        let (mut m, writer, store) = mirror();
        for mode in [Mode::Auto, Mode::Timer] {
            assert_eq!(m.toggle(0, mode), None);
        }
        writer.flush().await;

        assert_eq!(m.states(), [false; ACTUATORS]);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn toggle_out_of_range_is_ignored() {
        let (mut m, _, _) = mirror();
        assert_eq!(m.toggle(ACTUATORS, Mode::Manual), None);
    }

    #[tokio::test]
    async fn set_all_writes_every_actuator() {
        let (mut m, writer, store) = mirror();
        let changed = m.set_all([true, false, true, false]);
        writer.flush().await;

        assert_eq!(changed, vec![0, 2]);
        assert_eq!(store.writes().len(), ACTUATORS);
    }

    #[tokio::test]
    async fn converge_writes_only_changes() {
        let (mut m, writer, store) = mirror();
        m.set_all([true, false, false, false]);
        writer.flush().await;
        store.clear_writes();

        let changed = m.converge([true, true, false, false]);
        writer.flush().await;

        assert_eq!(changed, vec![1]);
        assert_eq!(store.writes(), vec![("motor_2".to_string(), json!(true))]);
    }

    #[tokio::test]
    async fn evaluate_and_activate_turns_on_dry_plants_only() {
        let (mut m, _, _) = mirror();
        m.set_all([false, true, false, true]);

        m.evaluate_and_activate(&snapshot([Some(10.0), Some(50.0), Some(19.9), None]), 20.0);
        assert_eq!(m.states(), [true, false, true, false]);
    }

    #[tokio::test]
    async fn all_off_clears_everything() {
        let (mut m, writer, store) = mirror();
        m.set_all([true; ACTUATORS]);
        m.all_off();
        writer.flush().await;

        assert_eq!(m.states(), [false; ACTUATORS]);
        assert_eq!(store.get("motor_4"), Some(json!(false)));
    }

    #[tokio::test]
    async fn mirror_adopts_pushed_values() {
        let (mut m, _, _) = mirror();
        assert_eq!(m.mirror(2, &json!(true)), Some(true));
        assert_eq!(m.mirror(2, &json!(1)), Some(false));
        assert_eq!(m.states(), [false, false, true, false]);
    }

    #[tokio::test]
    async fn mirror_ignores_garbage() {
        let (mut m, _, _) = mirror();
        assert_eq!(m.mirror(0, &json!("on")), None);
        assert_eq!(m.mirror(9, &json!(true)), None);
        assert_eq!(m.states(), [false; ACTUATORS]);
    }
}
