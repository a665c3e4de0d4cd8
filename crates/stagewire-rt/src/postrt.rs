//! Notifications posted by the audio thread for the main-thread idle pump.

use parking_lot::Mutex;

const POST_RT_CAPACITY: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostRtEventKind {
    ParameterValueChanged,
    ProgramChanged,
    MidiProgramChanged,
    NoteOn,
    NoteOff,
    LatencyChanged,
    ProcessTimedOut,
}

/// One posted notification. The integer/float payload slots follow the
/// engine callback shape so idle can forward them without reshaping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostRtEvent {
    pub kind: PostRtEventKind,
    pub value1: i32,
    pub value2: i32,
    pub value3: i32,
    pub valuef: f32,
    /// When set, idle turns the event into an engine callback; otherwise it
    /// only refreshes internal state.
    pub send_callback_later: bool,
}

/// Two-stage queue between the RT path and idle.
///
/// The RT thread appends to the pending list; idle splices pending into the
/// ready list with try-locks and drains ready in append order. The append
/// lock is only ever contended by the splice try-lock, so the RT thread
/// never waits behind a long critical section.
pub struct PostRtQueue {
    pending: Mutex<Vec<PostRtEvent>>,
    ready: Mutex<Vec<PostRtEvent>>,
}

impl PostRtQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(POST_RT_CAPACITY)),
            ready: Mutex::new(Vec::with_capacity(POST_RT_CAPACITY)),
        }
    }

    /// Called from the RT path. Never allocates: events past capacity are
    /// dropped.
    pub fn append_rt(&self, event: PostRtEvent) {
        let mut pending = self.pending.lock();
        if pending.len() < POST_RT_CAPACITY {
            pending.push(event);
        }
    }

    /// Moves pending events into the ready list. Both locks are tried; on
    /// contention the splice is deferred to the next idle tick.
    pub fn try_splice(&self) {
        let Some(mut pending) = self.pending.try_lock() else {
            return;
        };
        if pending.is_empty() {
            return;
        }
        let Some(mut ready) = self.ready.try_lock() else {
            return;
        };
        let take = (POST_RT_CAPACITY - ready.len()).min(pending.len());
        ready.extend(pending.drain(..take));
    }

    /// Drains one batch in append order. Main thread only.
    pub fn drain(&self) -> Vec<PostRtEvent> {
        let mut ready = self.ready.lock();
        std::mem::take(&mut *ready)
    }
}

impl Default for PostRtQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value1: i32) -> PostRtEvent {
        PostRtEvent {
            kind: PostRtEventKind::ParameterValueChanged,
            value1,
            value2: 0,
            value3: 0,
            valuef: 0.0,
            send_callback_later: true,
        }
    }

    #[test]
    fn splice_preserves_append_order() {
        let queue = PostRtQueue::new();
        for i in 0..5 {
            queue.append_rt(event(i));
        }
        queue.try_splice();
        let drained = queue.drain();
        let order: Vec<i32> = drained.iter().map(|e| e.value1).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn splice_defers_under_contention() {
        let queue = PostRtQueue::new();
        queue.append_rt(event(1));
        {
            let _hold = queue.ready.lock();
            queue.try_splice();
        }
        // Deferred, nothing lost.
        queue.try_splice();
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn append_drops_past_capacity() {
        let queue = PostRtQueue::new();
        for i in 0..(POST_RT_CAPACITY as i32 + 16) {
            queue.append_rt(event(i));
        }
        queue.try_splice();
        assert_eq!(queue.drain().len(), POST_RT_CAPACITY);
    }
}
