//! The uniform block shared by every program.

use super::{GpuError, GpuResult};
use bytemuck::{Pod, Zeroable};

/// Maximum number of taps in a kernel uniform.
pub const KERNEL_CAPACITY: usize = 12;

/// CPU mirror of the WGSL `Params` block bound at group 0, binding 5.
///
/// Kernels are packed as three `vec4`s so the block has the same layout in
/// both languages.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct ShaderUniforms {
    pub size: [f32; 2],
    pub norm_const: f32,
    pub norm_offset: f32,
    /// -1 when the quad is mirrored. Written by the device on each draw.
    pub flip_x: f32,
    pub threshold: f32,
    pub _pad: [f32; 2],
    pub kernel: [[f32; 4]; 3],
    pub hkern: [[f32; 4]; 3],
    pub vkern: [[f32; 4]; 3],
}

impl Default for ShaderUniforms {
    fn default() -> Self {
        Self {
            size: [1.0, 1.0],
            norm_const: 1.0,
            norm_offset: 0.0,
            flip_x: 1.0,
            threshold: 0.0,
            _pad: [0.0; 2],
            kernel: [[0.0; 4]; 3],
            hkern: [[0.0; 4]; 3],
            vkern: [[0.0; 4]; 3],
        }
    }
}

impl ShaderUniforms {
    pub const BYTE_SIZE: usize = std::mem::size_of::<ShaderUniforms>();

    pub fn set_1f(&mut self, name: &str, value: f32) -> GpuResult<()> {
        match name {
            "width" => self.size[0] = value,
            "height" => self.size[1] = value,
            "norm_const" => self.norm_const = value,
            "norm_offset" => self.norm_offset = value,
            "threshold" => self.threshold = value,
            _ => return Err(GpuError::UnknownUniform(name.to_string())),
        }
        Ok(())
    }

    pub fn set_1fv(&mut self, name: &str, values: &[f32]) -> GpuResult<()> {
        let slot = match name {
            "kernel" => &mut self.kernel,
            "hkern" => &mut self.hkern,
            "vkern" => &mut self.vkern,
            _ => return Err(GpuError::UnknownUniform(name.to_string())),
        };
        if values.len() > KERNEL_CAPACITY {
            return Err(GpuError::UniformArity {
                name: name.to_string(),
                max: KERNEL_CAPACITY,
                got: values.len(),
            });
        }
        *slot = [[0.0; 4]; 3];
        for (i, v) in values.iter().enumerate() {
            slot[i / 4][i % 4] = *v;
        }
        Ok(())
    }

    /// Tap `i` of the `kernel` array.
    pub fn kernel_tap(&self, i: usize) -> f32 {
        self.kernel[i / 4][i % 4]
    }

    pub fn hkern_tap(&self, i: usize) -> f32 {
        self.hkern[i / 4][i % 4]
    }

    pub fn vkern_tap(&self, i: usize) -> f32 {
        self.vkern[i / 4][i % 4]
    }
}
