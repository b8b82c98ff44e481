//! The shared display context.
//!
//! A [`DisplayContext`] owns the only GPU device and window of a pipeline.
//! A dedicated context thread creates both, then serves a typed action
//! queue: texture requests, frame uploads, redisplays and window property
//! changes. Any other thread that wants to touch the GPU takes the context
//! scope with [`DisplayContext::acquire`]; the returned guard is the only
//! way to reach the device.
//!
//! Frames are handed over double-buffered. A producer publishes a
//! candidate, the context thread uploads it under the scope and promotes it
//! to current, so readers never see a half-updated set. The context owns
//! the current set and returns it to the pool once a newer frame replaces
//! it; consumers read it under the scope and never return it themselves.

mod pool;
mod window;

pub use pool::{TexturePool, TextureSet, POOL_CAPACITY};
pub use window::{HeadlessHandle, HeadlessWindow, WindowBackend, WindowEvent};

use crate::frame::{VideoFormat, VideoFrame};
use crate::gpu::{GpuDevice, GpuError, SoftwareDevice};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// How often the context thread pumps window events while idle.
const PUMP_INTERVAL: Duration = Duration::from_millis(10);
/// How often a blocked texture request re-checks for teardown.
const REPLY_POLL: Duration = Duration::from_millis(20);

/// Window parameters handed to the context factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub title: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
    /// Foreign window to render into.
    pub window_id: Option<u64>,
    pub double_buffered: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            title: "morpheus".to_string(),
            x: 0,
            y: 0,
            width: 640,
            height: 480,
            visible: false,
            window_id: None,
            double_buffered: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("display context creation failed: {0}")]
    CreationFailed(String),
    #[error("display context was torn down")]
    TornDown,
    #[error("the calling thread already holds the display context scope")]
    ScopeHeld,
    #[error("frame rejected: {0}")]
    InvalidFrame(String),
    #[error("frame {0} was dropped before it became current")]
    FrameDropped(u64),
    #[error("texture set is still owned by the display context")]
    TextureInUse,
    #[error("texture set was already returned to the pool")]
    AlreadyReturned,
    #[error("timed out waiting for the display context")]
    Timeout,
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// What the window-system collaborator builds on the context thread.
pub struct ContextParts {
    pub device: Box<dyn GpuDevice>,
    pub window: Box<dyn WindowBackend>,
}

impl ContextParts {
    /// Software device behind a headless window.
    pub fn software(window: HeadlessWindow) -> Self {
        Self {
            device: Box::new(SoftwareDevice::new()),
            window: Box::new(window),
        }
    }
}

pub type ContextFactory =
    Box<dyn FnOnce(&ContextConfig) -> Result<ContextParts, ContextError> + Send>;
/// Draws the current frame on redisplay. Runs on the context thread with
/// the scope held.
pub type DrawCallback = Box<dyn FnMut(&mut dyn GpuDevice, &CurrentFrame) + Send>;
pub type ReshapeCallback = Box<dyn FnMut(&mut dyn GpuDevice, u32, u32) + Send>;

/// The frame most recently promoted by the context thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentFrame {
    pub seq: u64,
    pub textures: TextureSet,
}

impl CurrentFrame {
    pub fn format(&self) -> VideoFormat {
        self.textures.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.textures.width, self.textures.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Creating,
    Ready,
    Failed(String),
    TornDown,
}

struct Candidate {
    seq: u64,
    frame: VideoFrame,
    textures: TextureSet,
}

struct ContextState {
    phase: Phase,
    device: Option<Box<dyn GpuDevice>>,
    pool: TexturePool,
    candidate: Option<Candidate>,
    current: Option<CurrentFrame>,
    published: u64,
    consumed: u64,
}

struct Shared {
    state: Mutex<ContextState>,
    torn_down: AtomicBool,
    holder: Mutex<Option<ThreadId>>,
    /// Signalled when creation finishes, fails, or teardown starts.
    lifecycle: Condvar,
    /// Signalled when the candidate slot empties.
    frame_consumed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn holder(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes every waiter. Must not be called with the state lock taken,
    /// unless through a guard of the calling thread.
    fn notify_all(&self) {
        // Waiters test their predicate under the state lock, so passing
        // through it orders flag changes before their next test.
        if *self.holder() != Some(thread::current().id()) {
            drop(self.lock());
        }
        self.lifecycle.notify_all();
        self.frame_consumed.notify_all();
    }

    /// Error for a context that is not (or no longer) usable.
    fn unavailable(&self, phase: &Phase) -> Option<ContextError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Some(ContextError::TornDown);
        }
        match phase {
            Phase::Ready | Phase::Creating => None,
            Phase::Failed(msg) => Some(ContextError::CreationFailed(msg.clone())),
            Phase::TornDown => Some(ContextError::TornDown),
        }
    }
}

enum Action {
    Prepare {
        format: VideoFormat,
        width: u32,
        height: u32,
        reply: SyncSender<Result<TextureSet, ContextError>>,
    },
    Upload,
    Redisplay,
    Visible(bool),
    WindowId(u64),
    Reshape(u32, u32),
    SetDrawCallback(DrawCallback),
    SetReshapeCallback(ReshapeCallback),
    Destroy,
}

/// Exclusive access to the GPU device. Dropping it releases the scope.
pub struct ContextGuard<'a> {
    state: MutexGuard<'a, ContextState>,
    shared: &'a Shared,
}

impl ContextGuard<'_> {
    pub fn gpu(&mut self) -> &mut dyn GpuDevice {
        match self.state.device.as_deref_mut() {
            Some(device) => device,
            None => unreachable!("display context is ready without a device"),
        }
    }

    /// The device together with the shared texture pool.
    pub fn gpu_and_pool(&mut self) -> (&mut dyn GpuDevice, &mut TexturePool) {
        let state = &mut *self.state;
        match state.device.as_deref_mut() {
            Some(device) => (device, &mut state.pool),
            None => unreachable!("display context is ready without a device"),
        }
    }

    pub fn current_frame(&self) -> Option<&CurrentFrame> {
        self.state.current.as_ref()
    }

    /// Whether `textures` is the current frame or the pending candidate.
    fn owns(&self, textures: &TextureSet) -> bool {
        let current = self.state.current.as_ref().map(|c| &c.textures);
        let candidate = self.state.candidate.as_ref().map(|c| &c.textures);
        current.into_iter().chain(candidate).any(|t| t.overlaps(textures))
    }

    pub fn release(self) {}
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        *self.shared.holder() = None;
    }
}

/// Thread-safe façade over the pipeline's single GPU context and window.
pub struct DisplayContext {
    shared: Arc<Shared>,
    actions: Sender<Action>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DisplayContext {
    /// Spawns the context thread, which builds the device and window with
    /// `factory`. Use [`DisplayContext::wait_until_ready`] to learn the
    /// outcome.
    pub fn new(config: ContextConfig, factory: ContextFactory) -> Result<Self, ContextError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ContextState {
                phase: Phase::Creating,
                device: None,
                pool: TexturePool::new(),
                candidate: None,
                current: None,
                published: 0,
                consumed: 0,
            }),
            torn_down: AtomicBool::new(false),
            holder: Mutex::new(None),
            lifecycle: Condvar::new(),
            frame_consumed: Condvar::new(),
        });
        let (actions, rx) = mpsc::channel();
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("display-context".to_string())
            .spawn(move || run_context(thread_shared, rx, config, factory))
            .map_err(|e| ContextError::CreationFailed(e.to_string()))?;
        Ok(Self {
            shared,
            actions,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Context running the software device behind a headless window.
    pub fn headless(config: ContextConfig) -> Result<Self, ContextError> {
        let double_buffered = config.double_buffered;
        Self::new(
            config,
            Box::new(move |_| Ok(ContextParts::software(HeadlessWindow::new(double_buffered).0))),
        )
    }

    /// Blocks until creation has succeeded or failed.
    pub fn wait_until_ready(&self) -> Result<(), ContextError> {
        let state = self.shared.lock();
        let state = self
            .shared
            .lifecycle
            .wait_while(state, |s| {
                s.phase == Phase::Creating && !self.shared.torn_down.load(Ordering::SeqCst)
            })
            .unwrap_or_else(PoisonError::into_inner);
        match self.shared.unavailable(&state.phase) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.shared.torn_down.load(Ordering::SeqCst) && self.shared.lock().phase == Phase::Ready
    }

    fn check_not_holding(&self) -> Result<(), ContextError> {
        if *self.shared.holder() == Some(thread::current().id()) {
            return Err(ContextError::ScopeHeld);
        }
        Ok(())
    }

    /// Takes the context scope, waiting for creation first. Not re-entrant.
    pub fn acquire(&self) -> Result<ContextGuard<'_>, ContextError> {
        self.check_not_holding()?;
        self.wait_until_ready()?;
        let state = self.shared.lock();
        if let Some(e) = self.shared.unavailable(&state.phase) {
            return Err(e);
        }
        *self.shared.holder() = Some(thread::current().id());
        Ok(ContextGuard {
            state,
            shared: &self.shared,
        })
    }

    /// Asks the context thread for a texture set, pooled or new.
    ///
    /// Blocks until the context thread answers; returns
    /// [`ContextError::TornDown`] if the context goes away meanwhile.
    pub fn request_texture_slot(
        &self,
        format: VideoFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureSet, ContextError> {
        self.check_not_holding()?;
        self.wait_until_ready()?;
        let (reply, answer) = mpsc::sync_channel(1);
        self.send(Action::Prepare {
            format,
            width,
            height,
            reply,
        })?;
        loop {
            match answer.recv_timeout(REPLY_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(ContextError::TornDown),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.torn_down.load(Ordering::SeqCst) {
                        return Err(ContextError::TornDown);
                    }
                }
            }
        }
    }

    /// Hands a frame to the context thread for upload into `textures`.
    ///
    /// Blocks while a previous candidate has not been consumed. Returns the
    /// frame's sequence number for [`DisplayContext::wait_for_frame`].
    pub fn publish_frame(&self, frame: VideoFrame, textures: TextureSet) -> Result<u64, ContextError> {
        self.check_not_holding()?;
        if !textures.matches(frame.format, frame.width, frame.height) {
            return Err(ContextError::InvalidFrame(format!(
                "{}x{} {} frame does not fit {}x{} {} textures",
                frame.width, frame.height, frame.format, textures.width, textures.height, textures.format
            )));
        }
        if frame.planes().is_none() {
            return Err(ContextError::InvalidFrame(format!(
                "expected {} bytes, got {}",
                frame.format.frame_size(frame.width, frame.height),
                frame.data.len()
            )));
        }
        self.wait_until_ready()?;

        let state = self.shared.lock();
        let mut state = self
            .shared
            .frame_consumed
            .wait_while(state, |s| {
                s.candidate.is_some() && self.shared.unavailable(&s.phase).is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = self.shared.unavailable(&state.phase) {
            return Err(e);
        }
        state.published += 1;
        let seq = state.published;
        state.candidate = Some(Candidate {
            seq,
            frame,
            textures,
        });
        drop(state);
        self.send(Action::Upload)?;
        trace!("Published frame {}", seq);
        Ok(seq)
    }

    /// Waits until frame `seq` has been processed and returns the current
    /// frame, which is `seq` or a newer one.
    ///
    /// The returned textures stay owned by the context and are recycled as
    /// soon as a newer frame is promoted. Read them under the scope, e.g.
    /// through [`ContextGuard::current_frame`].
    pub fn wait_for_frame(
        &self,
        seq: u64,
        timeout: Option<Duration>,
    ) -> Result<CurrentFrame, ContextError> {
        self.check_not_holding()?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        loop {
            if let Some(e) = self.shared.unavailable(&state.phase) {
                return Err(e);
            }
            if state.consumed >= seq {
                return match &state.current {
                    Some(current) if current.seq >= seq => Ok(current.clone()),
                    _ => Err(ContextError::FrameDropped(seq)),
                };
            }
            state = match deadline {
                None => self
                    .shared
                    .frame_consumed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ContextError::Timeout);
                    }
                    self.shared
                        .frame_consumed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn current_frame(&self) -> Option<CurrentFrame> {
        self.shared.lock().current.clone()
    }

    /// Returns an unpublished texture set to the pool.
    ///
    /// Sets handed to [`DisplayContext::publish_frame`] belong to the
    /// context from then on and are refused with
    /// [`ContextError::TextureInUse`].
    pub fn clear_texture(&self, textures: TextureSet) -> Result<(), ContextError> {
        let mut guard = self.acquire()?;
        if guard.owns(&textures) {
            return Err(ContextError::TextureInUse);
        }
        let (gpu, pool) = guard.gpu_and_pool();
        if !pool.give_back(gpu, textures) {
            return Err(ContextError::AlreadyReturned);
        }
        Ok(())
    }

    pub fn post_redisplay(&self) -> Result<(), ContextError> {
        self.send(Action::Redisplay)
    }

    pub fn set_visible(&self, visible: bool) -> Result<(), ContextError> {
        self.send(Action::Visible(visible))
    }

    pub fn set_window_id(&self, id: u64) -> Result<(), ContextError> {
        self.send(Action::WindowId(id))
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<(), ContextError> {
        self.send(Action::Reshape(width, height))
    }

    pub fn set_draw_callback(&self, callback: DrawCallback) -> Result<(), ContextError> {
        self.send(Action::SetDrawCallback(callback))
    }

    pub fn set_reshape_callback(&self, callback: ReshapeCallback) -> Result<(), ContextError> {
        self.send(Action::SetReshapeCallback(callback))
    }

    fn send(&self, action: Action) -> Result<(), ContextError> {
        if self.shared.torn_down.load(Ordering::SeqCst) {
            return Err(ContextError::TornDown);
        }
        self.actions.send(action).map_err(|_| ContextError::TornDown)
    }

    /// Starts teardown and releases every waiter. Does not block on the
    /// context thread.
    pub fn teardown(&self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Tearing down display context");
        self.shared.notify_all();
        let _ = self.actions.send(Action::Destroy);
    }

    /// Tears down and joins the context thread.
    pub fn shutdown(&self) {
        self.teardown();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Display context thread panicked");
            }
        }
    }
}

impl Drop for DisplayContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ContextLoop {
    shared: Arc<Shared>,
    window: Box<dyn WindowBackend>,
    draw: Option<DrawCallback>,
    reshape: Option<ReshapeCallback>,
}

fn run_context(
    shared: Arc<Shared>,
    rx: Receiver<Action>,
    config: ContextConfig,
    factory: ContextFactory,
) {
    let parts = match factory(&config) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Failed to create display context: {}", e);
            shared.lock().phase = Phase::Failed(e.to_string());
            shared.notify_all();
            return;
        }
    };

    {
        let mut state = shared.lock();
        if shared.torn_down.load(Ordering::SeqCst) {
            state.phase = Phase::TornDown;
            drop(state);
            shared.notify_all();
            return;
        }
        info!(
            "Display context `{}` ready on {} ({}x{})",
            config.title,
            parts.device.name(),
            config.width,
            config.height
        );
        state.device = Some(parts.device);
        state.phase = Phase::Ready;
    }
    shared.notify_all();

    let mut context = ContextLoop {
        shared,
        window: parts.window,
        draw: None,
        reshape: None,
    };
    context.window.set_visible(config.visible);
    if let Some(id) = config.window_id {
        context.window.set_window_id(id);
    }
    context.run(rx);
    context.finish();
}

impl ContextLoop {
    fn run(&mut self, rx: Receiver<Action>) {
        loop {
            let flow = match rx.recv_timeout(PUMP_INTERVAL) {
                Ok(action) => self.handle(action),
                Err(RecvTimeoutError::Timeout) => ControlFlow::Continue(()),
                Err(RecvTimeoutError::Disconnected) => ControlFlow::Break(()),
            };
            if flow.is_break() || self.shared.torn_down.load(Ordering::SeqCst) {
                break;
            }
            for event in self.window.poll_events() {
                match event {
                    WindowEvent::Reshape { width, height } => self.reshape(width, height),
                    WindowEvent::Close => {
                        info!("Window closed");
                        self.shared.torn_down.store(true, Ordering::SeqCst);
                        self.shared.notify_all();
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, action: Action) -> ControlFlow<()> {
        match action {
            Action::Prepare {
                format,
                width,
                height,
                reply,
            } => {
                let result = self.prepare(format, width, height);
                let _ = reply.send(result);
            }
            Action::Upload => self.upload(),
            Action::Redisplay => self.redisplay(),
            Action::Visible(visible) => self.window.set_visible(visible),
            Action::WindowId(id) => self.window.set_window_id(id),
            Action::Reshape(width, height) => self.reshape(width, height),
            Action::SetDrawCallback(callback) => self.draw = Some(callback),
            Action::SetReshapeCallback(callback) => self.reshape = Some(callback),
            Action::Destroy => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn prepare(
        &mut self,
        format: VideoFormat,
        width: u32,
        height: u32,
    ) -> Result<TextureSet, ContextError> {
        let mut state = self.shared.lock();
        let state = &mut *state;
        let Some(device) = state.device.as_deref_mut() else {
            return Err(ContextError::TornDown);
        };
        Ok(state.pool.take(device, format, width, height)?)
    }

    fn upload(&mut self) {
        let mut state = self.shared.lock();
        let Some(candidate) = state.candidate.take() else {
            return;
        };
        let state_ref = &mut *state;
        let result = match state_ref.device.as_deref_mut() {
            Some(device) => upload_frame(device, &candidate),
            None => Err(ContextError::TornDown),
        };
        let retired = match result {
            Ok(()) => {
                trace!("Frame {} is current", candidate.seq);
                state_ref
                    .current
                    .replace(CurrentFrame {
                        seq: candidate.seq,
                        textures: candidate.textures,
                    })
                    .map(|previous| previous.textures)
            }
            Err(e) => {
                warn!("Dropping frame {}: {}", candidate.seq, e);
                Some(candidate.textures)
            }
        };
        if let (Some(textures), Some(device)) = (retired, state_ref.device.as_deref_mut()) {
            state_ref.pool.give_back(device, textures);
        }
        state.consumed = candidate.seq;
        drop(state);
        self.shared.frame_consumed.notify_all();
    }

    fn redisplay(&mut self) {
        {
            let mut state = self.shared.lock();
            let Some(current) = state.current.clone() else {
                return;
            };
            let Some(device) = state.device.as_deref_mut() else {
                return;
            };
            match &mut self.draw {
                Some(draw) => draw(device, &current),
                None => {
                    if let Err(e) = device.present(current.textures.primary().id) {
                        warn!("Present failed: {}", e);
                    }
                }
            }
        }
        if self.window.is_double_buffered() {
            self.window.swap_buffers();
        }
    }

    fn reshape(&mut self, width: u32, height: u32) {
        debug!("Reshape to {}x{}", width, height);
        let Some(reshape) = &mut self.reshape else {
            return;
        };
        let mut state = self.shared.lock();
        if let Some(device) = state.device.as_deref_mut() {
            reshape(device, width, height);
        }
    }

    fn finish(self) {
        let mut state = self.shared.lock();
        let state_ref = &mut *state;
        if let Some(mut device) = state_ref.device.take() {
            let held = state_ref.current.take().map(|c| c.textures);
            let pending = state_ref.candidate.take().map(|c| c.textures);
            for textures in held.into_iter().chain(pending) {
                state_ref.pool.give_back(device.as_mut(), textures);
            }
            state_ref.pool.drain(device.as_mut());
            debug!("Released {} device", device.name());
        }
        state_ref.candidate = None;
        state_ref.phase = Phase::TornDown;
        drop(state);
        self.shared.torn_down.store(true, Ordering::SeqCst);
        self.shared.notify_all();
        info!("Display context destroyed");
    }
}

fn upload_frame(device: &mut dyn GpuDevice, candidate: &Candidate) -> Result<(), ContextError> {
    let planes = candidate
        .frame
        .planes()
        .ok_or_else(|| ContextError::InvalidFrame("frame size changed".to_string()))?;
    for (texture, data) in candidate.textures.planes().iter().zip(planes) {
        device.upload_texture(texture.id, data)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ready_context() -> (DisplayContext, HeadlessHandle) {
        let (window, handle) = HeadlessWindow::new(true);
        let ctx = DisplayContext::new(
            ContextConfig::default(),
            Box::new(move |_| Ok(ContextParts::software(window))),
        )
        .unwrap();
        ctx.wait_until_ready().unwrap();
        (ctx, handle)
    }

    fn rgba_frame(w: u32, h: u32, value: u8) -> VideoFrame {
        VideoFrame::from_data(w, h, VideoFormat::Rgba, vec![value; (w * h * 4) as usize])
    }

    #[test]
    fn test_scope_is_exclusive() {
        let (ctx, _) = ready_context();
        let ctx = Arc::new(ctx);
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        let mut guard = ctx.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        guard.gpu().flush().unwrap();
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_request_is_refused() {
        let (ctx, _) = ready_context();
        let _guard = ctx.acquire().unwrap();
        assert!(matches!(ctx.acquire(), Err(ContextError::ScopeHeld)));
        assert!(matches!(
            ctx.request_texture_slot(VideoFormat::Rgba, 2, 2),
            Err(ContextError::ScopeHeld)
        ));
    }

    #[test]
    fn test_slot_reuse_after_clear() {
        let (ctx, _) = ready_context();
        let set = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
        let id = set.primary().id;
        ctx.clear_texture(set).unwrap();
        let again = ctx.request_texture_slot(VideoFormat::Rgba, 4, 4).unwrap();
        assert_eq!(again.primary().id, id);
    }

    #[test]
    fn test_published_frame_becomes_current() {
        let (ctx, _) = ready_context();
        let set = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let seq = ctx.publish_frame(rgba_frame(2, 2, 255), set.clone()).unwrap();
        let current = ctx
            .wait_for_frame(seq, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(current.seq, seq);
        assert_eq!(current.textures, set);

        let mut guard = ctx.acquire().unwrap();
        let texels = guard.gpu().read_texture(set.primary().id).unwrap();
        assert!(texels.iter().all(|t| *t == [1.0; 4]));
    }

    #[test]
    fn test_superseded_set_returns_to_pool() {
        let (ctx, _) = ready_context();
        let wait = Some(Duration::from_secs(5));
        let first = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let second = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let seq1 = ctx.publish_frame(rgba_frame(2, 2, 1), first.clone()).unwrap();
        let seq2 = ctx.publish_frame(rgba_frame(2, 2, 2), second.clone()).unwrap();
        ctx.wait_for_frame(seq2, wait).unwrap();

        // Asking for the older frame hands out the newer one.
        let current = ctx.wait_for_frame(seq1, wait).unwrap();
        assert_eq!(current.seq, seq2);
        assert_eq!(current.textures, second);

        assert!(matches!(
            ctx.clear_texture(second.clone()),
            Err(ContextError::TextureInUse)
        ));
        assert!(matches!(
            ctx.clear_texture(first.clone()),
            Err(ContextError::AlreadyReturned)
        ));

        let a = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let b = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        assert_eq!(a, first);
        assert!(!b.overlaps(&a));
        assert!(!b.overlaps(&second));
    }

    #[test]
    fn test_mismatched_frame_rejected() {
        let (ctx, _) = ready_context();
        let set = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        assert!(matches!(
            ctx.publish_frame(rgba_frame(4, 2, 0), set.clone()),
            Err(ContextError::InvalidFrame(_))
        ));
        let short = VideoFrame::from_data(2, 2, VideoFormat::Rgba, vec![0; 3]);
        assert!(matches!(
            ctx.publish_frame(short, set),
            Err(ContextError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_window_actions_are_forwarded() {
        let (ctx, handle) = ready_context();
        ctx.set_visible(true).unwrap();
        ctx.set_window_id(42).unwrap();
        let set = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let seq = ctx.publish_frame(rgba_frame(2, 2, 9), set).unwrap();
        ctx.wait_for_frame(seq, None).unwrap();
        ctx.post_redisplay().unwrap();
        // The prepare round trip orders us after the queued actions.
        ctx.request_texture_slot(VideoFormat::Rgba, 1, 1).unwrap();
        assert!(handle.is_visible());
        assert_eq!(handle.window_id(), 42);
        assert_eq!(handle.swaps(), 1);
    }

    #[test]
    fn test_single_buffered_window_never_swaps() {
        let (window, handle) = HeadlessWindow::new(false);
        let ctx = DisplayContext::new(
            ContextConfig::default(),
            Box::new(move |_| Ok(ContextParts::software(window))),
        )
        .unwrap();
        let set = ctx.request_texture_slot(VideoFormat::Rgba, 2, 2).unwrap();
        let seq = ctx.publish_frame(rgba_frame(2, 2, 9), set).unwrap();
        ctx.wait_for_frame(seq, None).unwrap();
        ctx.post_redisplay().unwrap();
        ctx.request_texture_slot(VideoFormat::Rgba, 1, 1).unwrap();
        assert_eq!(handle.swaps(), 0);
    }

    #[test]
    fn test_creation_failure_reaches_waiters() {
        let ctx = DisplayContext::new(
            ContextConfig::default(),
            Box::new(|_| Err(ContextError::CreationFailed("no display".to_string()))),
        )
        .unwrap();
        assert!(matches!(
            ctx.request_texture_slot(VideoFormat::Rgba, 2, 2),
            Err(ContextError::CreationFailed(_))
        ));
        assert!(ctx.acquire().is_err());
    }

    #[test]
    fn test_teardown_releases_blocked_request() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (window, _) = HeadlessWindow::new(true);
        let ctx = Arc::new(
            DisplayContext::new(
                ContextConfig::default(),
                Box::new(move |_| {
                    let _ = gate_rx.recv();
                    Ok(ContextParts::software(window))
                }),
            )
            .unwrap(),
        );

        let requester = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.request_texture_slot(VideoFormat::Rgba, 2, 2))
        };
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        ctx.teardown();
        let result = requester.join().unwrap();
        assert!(matches!(result, Err(ContextError::TornDown)));
        assert!(start.elapsed() < Duration::from_secs(2));

        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_window_close_tears_down() {
        let (ctx, handle) = ready_context();
        handle.inject(WindowEvent::Close);
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.is_ready() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(ctx.acquire(), Err(ContextError::TornDown)));
    }
}
