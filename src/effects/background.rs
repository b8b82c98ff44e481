//! Replacement backgrounds for the matte effect.

use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;
use thiserror::Error;

/// A decoded background picture.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundImage {
    image: RgbaImage,
}

impl BackgroundImage {
    /// Decodes an image file, scaled to `width` x `height`.
    pub fn load(path: &Path, width: u32, height: u32) -> image::ImageResult<Self> {
        let image = image::open(path)?.to_rgba8();
        Ok(Self::from_image(image).resized(width, height))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Single color background.
    pub fn solid(width: u32, height: u32, color: [u8; 4]) -> Self {
        Self::from_image(RgbaImage::from_pixel(width, height, image::Rgba(color)))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// The same picture at another size. Returns a copy when the size
    /// already matches.
    pub fn resized(&self, width: u32, height: u32) -> Self {
        if self.image.dimensions() == (width, height) {
            return self.clone();
        }
        Self::from_image(imageops::resize(&self.image, width, height, FilterType::Triangle))
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("background capture was cancelled")]
    Cancelled,
    #[error("background capture failed: {0}")]
    Failed(String),
    #[error("timed out waiting for the background capture")]
    Timeout,
}

/// Completion handle of a background change.
///
/// Resolves once the engine has uploaded the new background and saved the
/// reference frame the matte is computed against.
pub struct BackgroundCapture {
    done: Receiver<Result<(), String>>,
}

impl BackgroundCapture {
    pub(crate) fn channel() -> (CaptureSender, Self) {
        let (tx, rx) = mpsc::channel();
        (CaptureSender(tx), Self { done: rx })
    }

    pub fn wait(&self) -> Result<(), CaptureError> {
        match self.done.recv() {
            Ok(result) => result.map_err(CaptureError::Failed),
            Err(_) => Err(CaptureError::Cancelled),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), CaptureError> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => result.map_err(CaptureError::Failed),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Cancelled),
        }
    }

    /// `None` while the capture is still pending.
    pub fn try_result(&self) -> Option<Result<(), CaptureError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result.map_err(CaptureError::Failed)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(CaptureError::Cancelled)),
        }
    }
}

pub(crate) struct CaptureSender(Sender<Result<(), String>>);

impl CaptureSender {
    pub(crate) fn resolve(self, result: Result<(), String>) {
        // The requester may have stopped waiting.
        let _ = self.0.send(result);
    }
}

/// A background change waiting for its capture frame.
pub(crate) struct BackgroundRequest {
    pub image: BackgroundImage,
    pub frames_left: u32,
    pub done: Option<CaptureSender>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_to_frame() {
        let bg = BackgroundImage::solid(4, 2, [10, 20, 30, 255]);
        let scaled = bg.resized(8, 6);
        assert_eq!(scaled.dimensions(), (8, 6));
        assert_eq!(&scaled.as_raw()[..4], &[10, 20, 30, 255]);
        assert_eq!(bg.resized(4, 2), bg);
    }

    #[test]
    fn test_capture_resolution() {
        let (tx, capture) = BackgroundCapture::channel();
        assert!(capture.try_result().is_none());
        tx.resolve(Ok(()));
        assert_eq!(capture.wait(), Ok(()));
    }

    #[test]
    fn test_dropped_request_cancels() {
        let (tx, capture) = BackgroundCapture::channel();
        drop(tx);
        assert_eq!(
            capture.wait_timeout(Duration::from_millis(10)),
            Err(CaptureError::Cancelled)
        );
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("morpheus-no-such-background.png");
        assert!(BackgroundImage::load(&path, 4, 4).is_err());
    }
}
