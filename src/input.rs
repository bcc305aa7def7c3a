//! Host input events
//!
//! Host threads push events through cloned [`InputSender`]s; the session
//! drains the queue once per frame and turns each event into a CPU
//! interrupt.

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Vector raised for keyboard and mouse events
pub const KEYBOARD_VECTOR: u8 = 0x20;
/// Base vector for joysticks; port N raises `JOYSTICK_VECTOR_BASE + N`
pub const JOYSTICK_VECTOR_BASE: u8 = 0x30;
pub const MAX_JOYSTICKS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    Keyboard,
    Mouse,
    Joystick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputAction {
    Press,
    Release,
    Move,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub kind: InputKind,
    /// Key code, mouse button or joystick port
    pub code: u32,
    pub action: InputAction,
    pub axis_x: f32,
    pub axis_y: f32,
}

impl InputEvent {
    pub fn key(code: u32, action: InputAction) -> Self {
        InputEvent {
            kind: InputKind::Keyboard,
            code,
            action,
            axis_x: 0.0,
            axis_y: 0.0,
        }
    }

    pub fn joystick(port: u32, x: f32, y: f32) -> Self {
        InputEvent {
            kind: InputKind::Joystick,
            code: port,
            action: InputAction::Move,
            axis_x: x,
            axis_y: y,
        }
    }

    /// Interrupt vector this event raises
    pub fn vector(&self) -> u8 {
        match self.kind {
            InputKind::Keyboard | InputKind::Mouse => KEYBOARD_VECTOR,
            InputKind::Joystick => JOYSTICK_VECTOR_BASE + (self.code % MAX_JOYSTICKS) as u8,
        }
    }
}

/// Producer half, cheap to clone and hand to host threads
#[derive(Clone)]
pub struct InputSender(Sender<InputEvent>);

impl InputSender {
    /// Returns false once the session is gone
    pub fn send(&self, event: InputEvent) -> bool {
        trace!(?event, "input queued");
        self.0.send(event).is_ok()
    }
}

pub struct InputQueue {
    tx: Sender<InputEvent>,
    rx: Receiver<InputEvent>,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InputQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        InputQueue { tx, rx }
    }

    pub fn sender(&self) -> InputSender {
        InputSender(self.tx.clone())
    }

    pub fn push(&self, event: InputEvent) {
        // Both halves live in self, so the send cannot fail
        let _ = self.tx.send(event);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take every queued event in arrival order
    pub fn drain(&self) -> Vec<InputEvent> {
        let events: Vec<_> = self.rx.try_iter().collect();
        if !events.is_empty() {
            debug!("drained {} input events", events.len());
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_vectors() {
        assert_eq!(InputEvent::key(13, InputAction::Press).vector(), 0x20);
        assert_eq!(InputEvent::joystick(1, 0.5, -0.5).vector(), 0x31);
        assert_eq!(InputEvent::joystick(6, 0.0, 0.0).vector(), 0x32);
    }

    #[test]
    fn test_drain_preserves_order_across_threads() {
        let queue = InputQueue::new();
        let sender = queue.sender();
        thread::spawn(move || {
            for code in 0..5 {
                assert!(sender.send(InputEvent::key(code, InputAction::Press)));
            }
        })
        .join()
        .unwrap();
        queue.push(InputEvent::joystick(0, 1.0, 0.0));
        assert_eq!(queue.len(), 6);

        let events = queue.drain();
        let codes: Vec<_> = events.iter().map(|e| e.code).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 0]);
        assert_eq!(events[5].kind, InputKind::Joystick);
        assert!(queue.is_empty());
    }
}
