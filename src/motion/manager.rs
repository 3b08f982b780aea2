use std::rc::Rc;

use super::{EntryState, MotionHandle, MotionQueue, Priority, QueueEntry};
use crate::math::easing_sine;
use crate::model::Model;
use crate::motion::Motion;

/// Plays keyframed motions with priority arbitration.
///
/// Only the most recently started motion is current. A request is accepted
/// when it outranks whatever is reserved or playing; an equal priority may
/// preempt the current motion unless that motion is already fading out.
/// [`Priority::Force`] always wins.
#[derive(Default)]
pub struct MotionManager {
    queue: MotionQueue<Motion>,
    current_priority: Priority,
    reserve_priority: Priority,
}

impl MotionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    pub fn reserve_priority(&self) -> Priority {
        self.reserve_priority
    }

    /// Claim the right to start a motion at `priority` before it is available.
    pub fn reserve(&mut self, priority: Priority) -> bool {
        if priority == Priority::Force {
            self.reserve_priority = priority;
            return true;
        }
        if priority <= self.reserve_priority || priority < self.current_priority {
            return false;
        }
        if priority == self.current_priority && self.current_is_fading_out() {
            return false;
        }
        self.reserve_priority = priority;
        true
    }

    fn current_is_fading_out(&self) -> bool {
        let now = self.queue.time();
        self.queue
            .last()
            .is_some_and(|e| e.state(now) == EntryState::FadingOut)
    }

    /// Start `motion` if `priority` allows it, otherwise return [`MotionHandle::INVALID`].
    pub fn start_motion(&mut self, motion: Rc<Motion>, priority: Priority) -> MotionHandle {
        if !self.reserve(priority) {
            log::debug!(
                "Motion rejected at {:?} (current {:?}, reserved {:?})",
                priority,
                self.current_priority,
                self.reserve_priority
            );
            return MotionHandle::INVALID;
        }
        self.start_reserved(motion, priority)
    }

    /// Start a motion whose priority was already reserved.
    pub fn start_reserved(&mut self, motion: Rc<Motion>, priority: Priority) -> MotionHandle {
        if priority == self.reserve_priority {
            self.reserve_priority = Priority::None;
        }
        self.current_priority = priority;
        self.queue.start(motion, priority)
    }

    /// Release a reservation whose motion never arrived.
    pub fn cancel_reservation(&mut self, priority: Priority) {
        if self.reserve_priority == priority {
            self.reserve_priority = Priority::None;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn state(&self, handle: MotionHandle) -> Option<EntryState> {
        self.queue.state(handle)
    }

    pub fn fade_weight(&self, handle: MotionHandle) -> Option<f32> {
        self.queue
            .entries()
            .iter()
            .find(|e| e.handle() == handle)
            .map(QueueEntry::fade_weight)
    }

    pub fn entry_count(&self) -> usize {
        self.queue.len()
    }

    pub fn stop_all(&mut self) {
        self.queue.stop_all();
        self.current_priority = Priority::None;
    }

    /// Advance playback and write every playing motion into the model.
    /// Returns whether anything was applied.
    pub fn update(&mut self, model: &mut Model, delta_seconds: f32) -> bool {
        let now = self.queue.advance(delta_seconds);
        let mut updated = false;

        for entry in self.queue.entries_mut() {
            entry.begin(now);
            let weight = entry.update_fade_weight(now);
            if entry.is_finished() {
                continue;
            }

            let fade_in_start = entry.fade_in_start_time;
            let end_time = entry.end_time;
            let curve_weight = |fade_in: Option<f32>, fade_out: Option<f32>| {
                let fin = match fade_in {
                    Some(f) if f > 0.0 => easing_sine((now - fade_in_start) / f),
                    Some(_) => 1.0,
                    None => entry.fade_in_weight(now),
                };
                let fout = match (fade_out, end_time) {
                    (Some(f), Some(end)) if f > 0.0 => easing_sine((end - now) / f),
                    _ => 1.0,
                };
                fin * fout
            };
            entry
                .motion()
                .apply(model, now - entry.start_time(), weight, curve_weight);
            updated = true;
        }

        self.queue.retire();
        if self.queue.is_empty() {
            self.current_priority = Priority::None;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::model_from;

    fn clip(fade: f32, duration: f32) -> Rc<Motion> {
        let doc = serde_json::json!({
            "Meta": {"Duration": duration, "FadeInTime": fade, "FadeOutTime": fade},
            "Curves": [{"Target": "Parameter", "Id": "P", "Segments": [0.0, 1.0, 0, duration, 1.0]}]
        });
        Rc::new(Motion::from_json(doc.to_string().as_bytes()).unwrap())
    }

    fn model() -> Model {
        model_from(serde_json::json!({
            "Parameters": [{"Id": "P", "Min": 0.0, "Max": 1.0, "Default": 0.0}],
            "Drawables": []
        }))
    }

    #[test]
    fn test_equal_priority_preempts_and_fades_out() {
        let mut m = model();
        let mut mgr = MotionManager::new();
        let a = mgr.start_motion(clip(0.5, 4.0), Priority::Normal);
        assert!(a.is_valid());
        mgr.update(&mut m, 0.25);
        mgr.update(&mut m, 0.5);
        assert_eq!(mgr.state(a), Some(EntryState::Steady));

        let b = mgr.start_motion(clip(0.5, 4.0), Priority::Normal);
        assert!(b.is_valid());
        assert_eq!(mgr.state(a), Some(EntryState::FadingOut));
        assert_eq!(mgr.entry_count(), 2);

        mgr.update(&mut m, 0.25);
        assert_eq!(mgr.entry_count(), 2);
        assert!(mgr.fade_weight(a).unwrap() > 0.0);
        mgr.update(&mut m, 0.25);
        assert_eq!(mgr.state(a), None);
        assert_eq!(mgr.entry_count(), 1);
        assert_eq!(mgr.current_priority(), Priority::Normal);
    }

    #[test]
    fn test_lower_priority_rejected() {
        let mut mgr = MotionManager::new();
        assert!(mgr.start_motion(clip(0.5, 4.0), Priority::Normal).is_valid());
        assert_eq!(mgr.start_motion(clip(0.5, 4.0), Priority::Idle), MotionHandle::INVALID);
        assert_eq!(mgr.entry_count(), 1);
    }

    #[test]
    fn test_equal_priority_rejected_while_current_fades_out() {
        let mut m = model();
        let mut mgr = MotionManager::new();
        let a = mgr.start_motion(clip(0.5, 1.0), Priority::Normal);
        mgr.update(&mut m, 0.0);
        mgr.update(&mut m, 0.75);
        // the one-shot is inside its closing fade
        assert_eq!(mgr.state(a), Some(EntryState::FadingOut));
        assert_eq!(mgr.start_motion(clip(0.5, 1.0), Priority::Normal), MotionHandle::INVALID);
        assert!(mgr.start_motion(clip(0.5, 1.0), Priority::Force).is_valid());
    }

    #[test]
    fn test_force_always_wins() {
        let mut mgr = MotionManager::new();
        mgr.start_motion(clip(0.5, 4.0), Priority::Force);
        assert!(mgr.start_motion(clip(0.5, 4.0), Priority::Force).is_valid());
    }

    #[test]
    fn test_priority_resets_when_queue_drains() {
        let mut m = model();
        let mut mgr = MotionManager::new();
        mgr.start_motion(clip(0.0, 0.5), Priority::Normal);
        mgr.update(&mut m, 0.25);
        assert!((m.parameter_value("P") - 1.0).abs() < 1e-6);
        mgr.update(&mut m, 0.5);
        assert!(mgr.is_finished());
        assert_eq!(mgr.current_priority(), Priority::None);
        assert!(mgr.start_motion(clip(0.0, 0.5), Priority::Idle).is_valid());
    }

    #[test]
    fn test_at_most_one_current_motion() {
        let mut m = model();
        let mut mgr = MotionManager::new();
        for (i, p) in [Priority::Idle, Priority::Normal, Priority::Idle, Priority::Normal, Priority::Force]
            .into_iter()
            .enumerate()
        {
            mgr.start_motion(clip(0.25, 2.0), p);
            mgr.update(&mut m, 0.125 * i as f32);
            let steady_or_fading_in = mgr
                .queue
                .entries()
                .iter()
                .filter(|e| !e.is_fading_out())
                .count();
            assert!(steady_or_fading_in <= 1);
        }
    }
}
