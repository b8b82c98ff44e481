//! Reusable frame texture sets.

use crate::frame::VideoFormat;
use crate::gpu::{GpuDevice, GpuResult, Texture};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Free sets kept around before extra returns are destroyed.
pub const POOL_CAPACITY: usize = 8;

/// The textures backing one video frame: one to three planes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSet {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    planes: Vec<Texture>,
}

impl TextureSet {
    /// Plane 0 (RGBA or luma).
    pub fn primary(&self) -> &Texture {
        &self.planes[0]
    }

    pub fn planes(&self) -> &[Texture] {
        &self.planes
    }

    pub fn matches(&self, format: VideoFormat, width: u32, height: u32) -> bool {
        self.format == format && self.width == width && self.height == height
    }

    /// Whether any plane of `other` is also a plane of this set.
    pub fn overlaps(&self, other: &TextureSet) -> bool {
        self.planes
            .iter()
            .any(|p| other.planes.iter().any(|q| p.id == q.id))
    }

    /// Allocates every plane of a `format` frame. Planes created before a
    /// failure are deleted again.
    pub fn allocate(
        gpu: &mut dyn GpuDevice,
        format: VideoFormat,
        width: u32,
        height: u32,
    ) -> GpuResult<Self> {
        let mut planes = Vec::with_capacity(3);
        for layout in format.planes(width, height) {
            match gpu.create_texture(layout.width, layout.height, layout.format) {
                Ok(texture) => planes.push(texture),
                Err(e) => {
                    for texture in planes {
                        let _ = gpu.delete_texture(texture.id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    pub fn destroy(self, gpu: &mut dyn GpuDevice) {
        for texture in self.planes {
            if let Err(e) = gpu.delete_texture(texture.id) {
                warn!("Failed to delete pooled texture: {}", e);
            }
        }
    }
}

/// FIFO of returned texture sets.
///
/// A request reuses the oldest set of matching format and size. On a miss
/// the oldest free set is destroyed and a fresh one is allocated.
#[derive(Debug, Default)]
pub struct TexturePool {
    free: VecDeque<TextureSet>,
    allocations: u64,
    reuses: u64,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Number of sets allocated by [`TexturePool::take`].
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn reuses(&self) -> u64 {
        self.reuses
    }

    pub fn take(
        &mut self,
        gpu: &mut dyn GpuDevice,
        format: VideoFormat,
        width: u32,
        height: u32,
    ) -> GpuResult<TextureSet> {
        if let Some(i) = self.free.iter().position(|s| s.matches(format, width, height)) {
            if let Some(set) = self.free.remove(i) {
                self.reuses += 1;
                trace!("Reusing {}x{} {} texture set", width, height, format);
                return Ok(set);
            }
        }
        if let Some(set) = self.free.pop_front() {
            debug!(
                "Pooled {}x{} {} set does not fit {}x{} {}, destroying it",
                set.width, set.height, set.format, width, height, format
            );
            set.destroy(gpu);
        }
        let set = TextureSet::allocate(gpu, format, width, height)?;
        self.allocations += 1;
        debug!("Allocated {}x{} {} texture set", width, height, format);
        Ok(set)
    }

    /// Returns `set` to the free list. A set whose textures are already
    /// pooled is refused and `false` is returned.
    pub fn give_back(&mut self, gpu: &mut dyn GpuDevice, set: TextureSet) -> bool {
        if self.contains(&set) {
            warn!(
                "Refusing {}x{} {} texture set returned twice",
                set.width, set.height, set.format
            );
            return false;
        }
        if self.free.len() >= POOL_CAPACITY {
            set.destroy(gpu);
        } else {
            self.free.push_back(set);
        }
        true
    }

    pub fn contains(&self, set: &TextureSet) -> bool {
        self.free.iter().any(|s| s.overlaps(set))
    }

    /// Destroys every pooled set.
    pub fn drain(&mut self, gpu: &mut dyn GpuDevice) {
        for set in self.free.drain(..) {
            set.destroy(gpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuError, SoftwareDevice};

    #[test]
    fn test_same_size_is_reused() {
        let mut gpu = SoftwareDevice::new();
        let mut pool = TexturePool::new();
        let set = pool.take(&mut gpu, VideoFormat::Rgba, 8, 4).unwrap();
        let id = set.primary().id;
        pool.give_back(&mut gpu, set);

        let again = pool.take(&mut gpu, VideoFormat::Rgba, 8, 4).unwrap();
        assert_eq!(again.primary().id, id);
        assert_eq!(pool.allocations(), 1);
        assert_eq!(gpu.stats().textures_created, 1);
    }

    #[test]
    fn test_mismatch_destroys_and_allocates() {
        let mut gpu = SoftwareDevice::new();
        let mut pool = TexturePool::new();
        let set = pool.take(&mut gpu, VideoFormat::Rgba, 8, 4).unwrap();
        let old = set.primary().id;
        pool.give_back(&mut gpu, set);

        let fresh = pool.take(&mut gpu, VideoFormat::Rgba, 16, 4).unwrap();
        assert_ne!(fresh.primary().id, old);
        assert_eq!(gpu.stats().textures_alive, 1);
        assert!(gpu.read_texture(old).is_err());
    }

    #[test]
    fn test_matching_set_found_behind_others() {
        let mut gpu = SoftwareDevice::new();
        let mut pool = TexturePool::new();
        let small = pool.take(&mut gpu, VideoFormat::Rgba, 4, 4).unwrap();
        let large = pool.take(&mut gpu, VideoFormat::Rgba, 8, 8).unwrap();
        let (small_id, large_id) = (small.primary().id, large.primary().id);
        pool.give_back(&mut gpu, small);
        pool.give_back(&mut gpu, large);

        let again = pool.take(&mut gpu, VideoFormat::Rgba, 8, 8).unwrap();
        assert_eq!(again.primary().id, large_id);
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.reuses(), 1);
        // The 4x4 set stays pooled.
        assert_eq!(pool.len(), 1);
        assert!(gpu.read_texture(small_id).is_ok());
        let small = pool.take(&mut gpu, VideoFormat::Rgba, 4, 4).unwrap();
        assert_eq!(small.primary().id, small_id);
    }

    #[test]
    fn test_double_return_is_refused() {
        let mut gpu = SoftwareDevice::new();
        let mut pool = TexturePool::new();
        let set = pool.take(&mut gpu, VideoFormat::Rgba, 4, 4).unwrap();
        assert!(pool.give_back(&mut gpu, set.clone()));
        assert!(!pool.give_back(&mut gpu, set));
        assert_eq!(pool.len(), 1);

        let first = pool.take(&mut gpu, VideoFormat::Rgba, 4, 4).unwrap();
        let second = pool.take(&mut gpu, VideoFormat::Rgba, 4, 4).unwrap();
        assert!(!first.overlaps(&second));
    }

    #[test]
    fn test_planar_allocation_rolls_back() {
        // Room for the 4x4 luma plane only.
        let mut gpu = SoftwareDevice::with_memory_budget(16);
        let err = TextureSet::allocate(&mut gpu, VideoFormat::I420, 4, 4).unwrap_err();
        assert!(matches!(err, GpuError::OutOfMemory { .. }));
        assert_eq!(gpu.stats().textures_alive, 0);
    }

    #[test]
    fn test_capacity_bounds_free_list() {
        let mut gpu = SoftwareDevice::new();
        let mut pool = TexturePool::new();
        for _ in 0..POOL_CAPACITY + 2 {
            let set = TextureSet::allocate(&mut gpu, VideoFormat::Rgba, 2, 2).unwrap();
            pool.give_back(&mut gpu, set);
        }
        assert_eq!(pool.len(), POOL_CAPACITY);
        pool.drain(&mut gpu);
        assert_eq!(gpu.stats().textures_alive, 0);
    }
}
