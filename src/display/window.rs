//! Window-system collaborator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Events the window system reports to the context thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Reshape { width: u32, height: u32 },
    Close,
}

/// A native window owned by the context thread.
pub trait WindowBackend: Send {
    fn set_visible(&mut self, visible: bool);
    /// Embeds the output into a foreign window.
    fn set_window_id(&mut self, id: u64);
    fn is_double_buffered(&self) -> bool;
    fn swap_buffers(&mut self);
    /// Drains pending window-system events.
    fn poll_events(&mut self) -> Vec<WindowEvent>;
}

#[derive(Default)]
struct HeadlessState {
    visible: AtomicBool,
    window_id: AtomicU64,
    swaps: AtomicU64,
    events: Mutex<VecDeque<WindowEvent>>,
}

/// Window stand-in for offscreen operation.
pub struct HeadlessWindow {
    double_buffered: bool,
    state: Arc<HeadlessState>,
}

/// Observer and event injector for a [`HeadlessWindow`].
#[derive(Clone)]
pub struct HeadlessHandle {
    state: Arc<HeadlessState>,
}

impl HeadlessWindow {
    pub fn new(double_buffered: bool) -> (Self, HeadlessHandle) {
        let state = Arc::new(HeadlessState::default());
        let handle = HeadlessHandle {
            state: state.clone(),
        };
        (
            Self {
                double_buffered,
                state,
            },
            handle,
        )
    }
}

impl WindowBackend for HeadlessWindow {
    fn set_visible(&mut self, visible: bool) {
        self.state.visible.store(visible, Ordering::SeqCst);
    }

    fn set_window_id(&mut self, id: u64) {
        self.state.window_id.store(id, Ordering::SeqCst);
    }

    fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }

    fn swap_buffers(&mut self) {
        self.state.swaps.fetch_add(1, Ordering::SeqCst);
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl HeadlessHandle {
    pub fn is_visible(&self) -> bool {
        self.state.visible.load(Ordering::SeqCst)
    }

    pub fn window_id(&self) -> u64 {
        self.state.window_id.load(Ordering::SeqCst)
    }

    pub fn swaps(&self) -> u64 {
        self.state.swaps.load(Ordering::SeqCst)
    }

    /// Queues an event as if the window system had produced it.
    pub fn inject(&self, event: WindowEvent) {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }
}
