//! Fade-weighted playback queues for motions and expressions.
//!
//! Both kinds of animation share [`MotionQueue`]: entries are appended when
//! started, every older entry is sent into its fade-out at that moment, and
//! entries are dropped once they finish or once a newer entry has fully faded in.

pub mod curve;
pub mod expression;
pub mod manager;

use std::rc::Rc;

use crate::math::easing_sine;

pub use curve::Motion;
pub use expression::{Expression, ExpressionManager};
pub use manager::MotionManager;

/// Start priority of a motion. Higher priorities preempt lower ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    #[default]
    None = 0,
    Idle = 1,
    Normal = 2,
    Force = 3,
}

impl Priority {
    pub fn from_i32(value: i32) -> Self {
        match value {
            i32::MIN..=0 => Priority::None,
            1 => Priority::Idle,
            2 => Priority::Normal,
            _ => Priority::Force,
        }
    }
}

/// Identifies one started entry. [`MotionHandle::INVALID`] means the start was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MotionHandle(i64);

impl MotionHandle {
    pub const INVALID: MotionHandle = MotionHandle(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

/// Lifecycle of a queued entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Starting,
    FadingIn,
    Steady,
    FadingOut,
    Finished,
}

/// Timing data the queue needs from whatever it plays.
pub trait QueueMotion {
    fn fade_in_seconds(&self) -> f32;
    fn fade_out_seconds(&self) -> f32;
    /// Length of one-shot playback, `None` for looping or open-ended entries.
    fn duration(&self) -> Option<f32>;
}

pub struct QueueEntry<M> {
    motion: Rc<M>,
    handle: MotionHandle,
    priority: Priority,
    started: bool,
    finished: bool,
    fade_out_triggered: bool,
    start_time: f32,
    fade_in_start_time: f32,
    end_time: Option<f32>,
    fade_out_seconds: f32,
    fade_weight: f32,
}

impl<M: QueueMotion> QueueEntry<M> {
    fn new(motion: Rc<M>, handle: MotionHandle, priority: Priority) -> Self {
        let fade_out_seconds = motion.fade_out_seconds();
        Self {
            motion,
            handle,
            priority,
            started: false,
            finished: false,
            fade_out_triggered: false,
            start_time: 0.0,
            fade_in_start_time: 0.0,
            end_time: None,
            fade_out_seconds,
            fade_weight: 0.0,
        }
    }

    pub fn motion(&self) -> &M {
        &self.motion
    }

    pub fn handle(&self) -> MotionHandle {
        self.handle
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn start_time(&self) -> f32 {
        self.start_time
    }

    pub fn fade_weight(&self) -> f32 {
        self.fade_weight
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_fading_out(&self) -> bool {
        self.fade_out_triggered
    }

    /// Fix the start time on the first tick the entry is seen.
    pub fn begin(&mut self, now: f32) {
        if self.started {
            return;
        }
        self.started = true;
        self.start_time = now;
        self.fade_in_start_time = now;
        let natural_end = self.motion.duration().map(|d| now + d);
        self.end_time = match (self.end_time, natural_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Schedule the end of this entry `fade_out_seconds` from `now`, keeping an earlier end.
    pub fn trigger_fade_out(&mut self, now: f32) {
        self.fade_out_triggered = true;
        let end = now + self.fade_out_seconds;
        self.end_time = Some(self.end_time.map_or(end, |e| e.min(end)));
    }

    pub fn fade_in_weight(&self, now: f32) -> f32 {
        let fade_in = self.motion.fade_in_seconds();
        if fade_in <= 0.0 {
            1.0
        } else {
            easing_sine((now - self.fade_in_start_time) / fade_in)
        }
    }

    fn fade_out_weight(&self, now: f32) -> f32 {
        match self.end_time {
            Some(end) if self.fade_out_seconds > 0.0 => easing_sine((end - now) / self.fade_out_seconds),
            _ => 1.0,
        }
    }

    /// Recompute and store the weight for `now`, marking the entry finished past its end.
    pub fn update_fade_weight(&mut self, now: f32) -> f32 {
        if self.end_time.is_some_and(|end| now >= end) {
            self.finished = true;
            self.fade_weight = 0.0;
        } else {
            self.fade_weight = self.fade_in_weight(now) * self.fade_out_weight(now);
        }
        self.fade_weight
    }

    pub fn state(&self, now: f32) -> EntryState {
        if self.finished {
            return EntryState::Finished;
        }
        if !self.started {
            return EntryState::Starting;
        }
        if self.fade_out_triggered {
            return EntryState::FadingOut;
        }
        if let Some(end) = self.end_time {
            if self.fade_out_seconds > 0.0 && end - now < self.fade_out_seconds {
                return EntryState::FadingOut;
            }
        }
        if self.fade_in_weight(now) < 1.0 {
            return EntryState::FadingIn;
        }
        EntryState::Steady
    }
}

/// Ordered set of playing entries sharing one clock.
pub struct MotionQueue<M> {
    entries: Vec<QueueEntry<M>>,
    time: f32,
    next_handle: i64,
}

impl<M> Default for MotionQueue<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            time: 0.0,
            next_handle: 0,
        }
    }
}

impl<M: QueueMotion> MotionQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and start fading out everything already queued.
    pub fn start(&mut self, motion: Rc<M>, priority: Priority) -> MotionHandle {
        let now = self.time;
        for entry in &mut self.entries {
            if !entry.fade_out_triggered {
                entry.trigger_fade_out(now);
            }
        }
        let handle = MotionHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push(QueueEntry::new(motion, handle, priority));
        handle
    }

    pub fn advance(&mut self, delta_seconds: f32) -> f32 {
        self.time += delta_seconds;
        self.time
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn entries(&self) -> &[QueueEntry<M>] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [QueueEntry<M>] {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&QueueEntry<M>> {
        self.entries.last()
    }

    pub fn state(&self, handle: MotionHandle) -> Option<EntryState> {
        self.entries
            .iter()
            .find(|e| e.handle == handle)
            .map(|e| e.state(self.time))
    }

    /// Drop finished entries, then every entry older than the newest fully faded-in one.
    pub fn retire(&mut self) {
        self.entries.retain(|e| !e.finished);
        if let Some(newest_full) = self.entries.iter().rposition(|e| e.fade_weight >= 1.0) {
            if newest_full > 0 {
                log::trace!("Purging {} superseded entries", newest_full);
                self.entries.drain(..newest_full);
            }
        }
    }

    pub fn stop_all(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clip {
        fade_in: f32,
        fade_out: f32,
        duration: Option<f32>,
    }

    impl QueueMotion for Clip {
        fn fade_in_seconds(&self) -> f32 {
            self.fade_in
        }
        fn fade_out_seconds(&self) -> f32 {
            self.fade_out
        }
        fn duration(&self) -> Option<f32> {
            self.duration
        }
    }

    fn tick(queue: &mut MotionQueue<Clip>, dt: f32) {
        let now = queue.advance(dt);
        for e in queue.entries_mut() {
            e.begin(now);
            e.update_fade_weight(now);
        }
        queue.retire();
    }

    #[test]
    fn test_entry_lifecycle() {
        let mut q = MotionQueue::new();
        let h = q.start(Rc::new(Clip { fade_in: 0.5, fade_out: 0.5, duration: Some(2.0) }), Priority::Normal);
        assert_eq!(q.state(h), Some(EntryState::Starting));
        tick(&mut q, 0.25);
        assert_eq!(q.state(h), Some(EntryState::FadingIn));
        tick(&mut q, 0.5);
        assert_eq!(q.state(h), Some(EntryState::Steady));
        tick(&mut q, 1.25);
        assert_eq!(q.state(h), Some(EntryState::FadingOut));
        tick(&mut q, 0.5);
        assert_eq!(q.state(h), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fade_weight_is_monotonic_during_fade_in() {
        let mut q = MotionQueue::new();
        q.start(Rc::new(Clip { fade_in: 1.0, fade_out: 0.0, duration: None }), Priority::Idle);
        let mut last = -1.0;
        for _ in 0..8 {
            tick(&mut q, 0.125);
            let w = q.entries()[0].fade_weight();
            assert!(w >= last);
            last = w;
        }
        assert!((last - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_purges_entries_older_than_fully_faded_in() {
        let mut q = MotionQueue::new();
        q.start(Rc::new(Clip { fade_in: 0.0, fade_out: 10.0, duration: None }), Priority::Normal);
        tick(&mut q, 0.125);
        q.start(Rc::new(Clip { fade_in: 0.25, fade_out: 10.0, duration: None }), Priority::Normal);
        tick(&mut q, 0.125);
        assert_eq!(q.len(), 2);
        tick(&mut q, 0.125);
        assert_eq!(q.len(), 2);
        tick(&mut q, 0.125);
        // the newer entry is fully in, the older one is gone even though its fade-out is long
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_priority_from_i32() {
        assert_eq!(Priority::from_i32(-3), Priority::None);
        assert_eq!(Priority::from_i32(2), Priority::Normal);
        assert_eq!(Priority::from_i32(9), Priority::Force);
    }
}
