//! Per-room playback state machine.
//!
//! Each joined room owns one [`Session`]. Transport commands flip flags under
//! a mutex, and the playback loop blocks on a condvar while paused instead of
//! spinning, waking only when a command arrives.

use std::sync::{Condvar, Mutex, MutexGuard};

use detect_core::Detection;
use video_source::Frame;

/// What the playback loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    /// Decode and publish the next sequential frame.
    Advance,
    /// Re-publish the frame one before the cursor, staying paused.
    StepBackward,
    /// Publish the frame one after the cursor, staying paused.
    StepForward,
    /// Tear down the loop.
    Halt,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags {
    pub stopped: bool,
    pub paused: bool,
    pub stepping_forward: bool,
    pub stepping_backward: bool,
}

#[derive(Default)]
struct SessionState {
    flags: Flags,
    cursor: u64,
    total_frames: u64,
    frame_width: i32,
    frame_height: i32,
    last_frame: Option<Frame>,
    last_detections: Vec<Detection>,
    diagnosis: String,
    save_footage: bool,
}

/// A frozen copy of the most recently published frame, for feedback encoding.
pub(crate) struct FeedbackSnapshot {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub width: i32,
    pub height: i32,
}

pub(crate) struct Session {
    room: String,
    state: Mutex<SessionState>,
    cond: Condvar,
}

impl Session {
    pub(crate) fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            state: Mutex::new(SessionState::default()),
            cond: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn room(&self) -> &str {
        &self.room
    }

    /// Arm the session for a new playback run, clearing every flag including
    /// a previous terminal stop.
    pub(crate) fn set_video(
        &self,
        total_frames: u64,
        width: i32,
        height: i32,
        diagnosis: impl Into<String>,
        save_footage: bool,
    ) {
        let mut state = self.locked();
        state.flags = Flags::default();
        state.cursor = 0;
        state.total_frames = total_frames;
        state.frame_width = width;
        state.frame_height = height;
        state.last_frame = None;
        state.last_detections.clear();
        state.diagnosis = diagnosis.into();
        state.save_footage = save_footage;
        self.cond.notify_all();
    }

    pub(crate) fn pause(&self) {
        let mut state = self.locked();
        if state.flags.stopped {
            return;
        }
        state.flags.paused = true;
        self.cond.notify_all();
    }

    pub(crate) fn unpause(&self) {
        let mut state = self.locked();
        if state.flags.stopped {
            return;
        }
        state.flags.paused = false;
        state.flags.stepping_forward = false;
        state.flags.stepping_backward = false;
        self.cond.notify_all();
    }

    /// Step one frame back. Implies pause so the step lands on a still image.
    pub(crate) fn reverse(&self) {
        let mut state = self.locked();
        if state.flags.stopped {
            return;
        }
        state.flags.paused = true;
        state.flags.stepping_backward = true;
        state.flags.stepping_forward = false;
        self.cond.notify_all();
    }

    pub(crate) fn forward(&self) {
        let mut state = self.locked();
        if state.flags.stopped {
            return;
        }
        state.flags.paused = true;
        state.flags.stepping_forward = true;
        state.flags.stepping_backward = false;
        self.cond.notify_all();
    }

    /// Terminal for the current playback run. Clears the other flags so a
    /// blocked loop wakes straight into `Halt`.
    pub(crate) fn stop(&self) {
        let mut state = self.locked();
        state.flags.stopped = true;
        state.flags.paused = false;
        state.flags.stepping_forward = false;
        state.flags.stepping_backward = false;
        self.cond.notify_all();
    }

    /// Block until the loop has something to do. Step flags are consumed here,
    /// under the same lock that observed them, so one command yields exactly
    /// one step.
    pub(crate) fn next_directive(&self) -> Directive {
        let mut state = self.locked();
        loop {
            if state.flags.stopped {
                return Directive::Halt;
            }
            if state.flags.stepping_backward {
                state.flags.stepping_backward = false;
                return Directive::StepBackward;
            }
            if state.flags.stepping_forward {
                state.flags.stepping_forward = false;
                return Directive::StepForward;
            }
            if !state.flags.paused {
                return Directive::Advance;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|err| err.into_inner());
        }
    }

    pub(crate) fn store_result(&self, frame: Frame, detections: Vec<Detection>) {
        let mut state = self.locked();
        state.last_frame = Some(frame);
        state.last_detections = detections;
    }

    pub(crate) fn snapshot(&self) -> Option<FeedbackSnapshot> {
        let state = self.locked();
        state.last_frame.as_ref().map(|frame| FeedbackSnapshot {
            frame: frame.clone(),
            detections: state.last_detections.clone(),
            width: state.frame_width,
            height: state.frame_height,
        })
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.locked().cursor
    }

    pub(crate) fn set_cursor(&self, index: u64) {
        self.locked().cursor = index;
    }

    pub(crate) fn total_frames(&self) -> u64 {
        self.locked().total_frames
    }

    pub(crate) fn flags(&self) -> Flags {
        self.locked().flags
    }

    pub(crate) fn diagnosis(&self) -> String {
        self.locked().diagnosis.clone()
    }

    pub(crate) fn save_footage(&self) -> bool {
        self.locked().save_footage
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn runs_until_paused() {
        let session = Session::new("a");
        session.set_video(10, 640, 480, "", false);
        assert_eq!(session.next_directive(), Directive::Advance);
        assert_eq!(session.next_directive(), Directive::Advance);
    }

    #[test]
    fn step_flags_fire_once() {
        let session = Session::new("a");
        session.set_video(10, 640, 480, "", false);
        session.reverse();
        assert_eq!(session.next_directive(), Directive::StepBackward);
        session.forward();
        assert_eq!(session.next_directive(), Directive::StepForward);
        // Both steps consumed; still paused, so unpause resumes normal play.
        let flags = session.flags();
        assert!(flags.paused);
        assert!(!flags.stepping_forward && !flags.stepping_backward);
        session.unpause();
        assert_eq!(session.next_directive(), Directive::Advance);
    }

    #[test]
    fn forward_replaces_pending_reverse() {
        let session = Session::new("a");
        session.set_video(10, 640, 480, "", false);
        session.reverse();
        session.forward();
        let flags = session.flags();
        assert!(flags.stepping_forward);
        assert!(!flags.stepping_backward);
    }

    #[test]
    fn stop_is_terminal_for_commands() {
        let session = Session::new("a");
        session.set_video(10, 640, 480, "", false);
        session.stop();
        assert_eq!(session.next_directive(), Directive::Halt);
        session.unpause();
        session.forward();
        assert_eq!(session.next_directive(), Directive::Halt);
    }

    #[test]
    fn set_video_rearms_after_stop() {
        let session = Session::new("a");
        session.set_video(10, 640, 480, "", false);
        session.stop();
        assert_eq!(session.next_directive(), Directive::Halt);
        session.set_video(5, 320, 240, "Adenomatous", true);
        assert_eq!(session.next_directive(), Directive::Advance);
        assert_eq!(session.total_frames(), 5);
        assert!(session.save_footage());
    }

    #[test]
    fn paused_wait_wakes_on_stop() {
        let session = Arc::new(Session::new("a"));
        session.set_video(10, 640, 480, "", false);
        session.pause();

        let waiter = {
            let session = session.clone();
            thread::spawn(move || session.next_directive())
        };
        thread::sleep(Duration::from_millis(50));
        session.stop();
        assert_eq!(waiter.join().unwrap(), Directive::Halt);
    }

    #[test]
    fn concurrent_steps_never_arm_both_directions() {
        let session = Arc::new(Session::new("a"));
        session.set_video(100, 640, 480, "", false);

        let mut handles = Vec::new();
        for i in 0..4 {
            let session = session.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        session.reverse();
                    } else {
                        session.forward();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let flags = session.flags();
        assert!(!(flags.stepping_forward && flags.stepping_backward));
    }
}
