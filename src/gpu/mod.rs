//! GPU device abstraction.
//!
//! The effect stage drives the GPU through [`GpuDevice`], a small state
//! machine modelled on immediate-mode graphics APIs: one bound framebuffer
//! with a single color attachment, one active program, four named texture
//! units and a full-screen quad draw. Two implementations exist:
//! [`WgpuDevice`] renders on real hardware, [`SoftwareDevice`] rasterizes on
//! the CPU for headless hosts and tests.

pub mod fragment;
pub mod software;
pub mod uniforms;
pub mod wgpu_device;

pub use fragment::{Fragment, FragmentKernel};
pub use software::SoftwareDevice;
pub use uniforms::ShaderUniforms;
pub use wgpu_device::WgpuDevice;

use crate::shader::ShaderError;
use std::fmt;
use thiserror::Error;

macro_rules! handle {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(TextureId, "texture");
handle!(FramebufferId, "framebuffer");
handle!(ProgramId, "program");

/// Storage format of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit normalized RGBA, the format of video frames and outputs.
    Rgba8,
    /// Half-float RGBA, used for intermediate passes.
    Rgba16Float,
    /// Single 8-bit channel (luma or chroma planes).
    R8,
    /// Two interleaved 8-bit channels (NV12 chroma).
    Rg8,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
        }
    }

    pub fn channels(self) -> usize {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Rgba16Float => 4,
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, TextureFormat::Rgba16Float)
    }

    /// Bytes needed to store a `width` x `height` image in this format.
    pub fn image_bytes(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_texel()
    }
}

/// A 2D texture living on a [`GpuDevice`].
///
/// The value is a plain description plus handle. Ownership is by
/// convention: whoever created the texture deletes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Texture {
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn matches(&self, width: u32, height: u32, format: TextureFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// Texture units visible to fragment programs.
///
/// Unit `Tex` carries the pass input; `Base` and `Blend` are the extra
/// inputs of compositing passes; `Curve` holds 1-D lookup tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureUnit {
    Tex,
    Base,
    Blend,
    Curve,
}

impl TextureUnit {
    pub const ALL: [TextureUnit; 4] = [
        TextureUnit::Tex,
        TextureUnit::Base,
        TextureUnit::Blend,
        TextureUnit::Curve,
    ];

    pub fn index(self) -> usize {
        match self {
            TextureUnit::Tex => 0,
            TextureUnit::Base => 1,
            TextureUnit::Blend => 2,
            TextureUnit::Curve => 3,
        }
    }
}

/// Completeness of the bound framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    NoFramebuffer,
    MissingAttachment,
}

/// Model transform applied to the full-screen quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuadTransform {
    #[default]
    Identity,
    /// Reflect about the vertical center axis.
    MirrorX,
}

/// Sources handed to [`GpuDevice::compile_program`].
///
/// `vertex` falls back to the built-in full-screen quad shader. `kernel` is
/// the CPU rendition of the fragment stage, required by devices that cannot
/// run shader code.
#[derive(Clone, Copy)]
pub struct ProgramDesc<'a> {
    pub label: &'a str,
    pub vertex: Option<&'a str>,
    pub fragment: &'a str,
    pub kernel: Option<FragmentKernel>,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub textures_alive: usize,
    pub textures_created: u64,
    pub texture_bytes: usize,
    pub framebuffers_alive: usize,
    pub programs_alive: usize,
    pub programs_compiled: u64,
    pub draws: u64,
    pub flushes: u64,
    pub presents: u64,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no suitable GPU adapter: {0}")]
    NoAdapter(String),
    #[error("failed to create GPU device: {0}")]
    DeviceCreation(String),
    #[error("out of texture memory allocating {width}x{height} {format:?}")]
    OutOfMemory {
        width: u32,
        height: u32,
        format: TextureFormat,
    },
    #[error("invalid texture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("unknown {0}")]
    UnknownTexture(TextureId),
    #[error("unknown {0}")]
    UnknownFramebuffer(FramebufferId),
    #[error("unknown {0}")]
    UnknownProgram(ProgramId),
    #[error("no program is active")]
    NoActiveProgram,
    #[error("unknown uniform `{0}`")]
    UnknownUniform(String),
    #[error("uniform `{name}` holds at most {max} values, got {got}")]
    UniformArity { name: String, max: usize, got: usize },
    #[error("upload to {texture} expects {expected} bytes, got {actual}")]
    UploadSize {
        texture: TextureId,
        expected: usize,
        actual: usize,
    },
    #[error("no framebuffer is bound")]
    NoFramebuffer,
    #[error("framebuffer is incomplete: {0:?}")]
    Incomplete(FramebufferStatus),
    #[error("{0} is sampled while being rendered to")]
    FeedbackLoop(TextureId),
    #[error("texture readback failed: {0}")]
    Readback(String),
    #[error("surface error: {0}")]
    Surface(String),
}

pub type GpuResult<T> = Result<T, GpuError>;

/// The GPU state machine every rendering path goes through.
///
/// Implementations are not thread-safe by themselves; the display context
/// serializes access.
pub trait GpuDevice: Send {
    /// Human readable backend name for logs.
    fn name(&self) -> &str;

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> GpuResult<Texture>;
    fn delete_texture(&mut self, texture: TextureId) -> GpuResult<()>;
    /// Replaces the whole texture content with tightly packed rows.
    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> GpuResult<()>;
    /// Reads every texel back as RGBA floats, row 0 first.
    fn read_texture(&mut self, texture: TextureId) -> GpuResult<Vec<[f32; 4]>>;

    fn create_framebuffer(&mut self) -> GpuResult<FramebufferId>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) -> GpuResult<()>;
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()>;
    /// Sets the color attachment of the bound framebuffer.
    fn attach_color(&mut self, texture: Option<TextureId>) -> GpuResult<()>;
    fn framebuffer_status(&self) -> FramebufferStatus;

    fn compile_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramId, ShaderError>;
    fn delete_program(&mut self, program: ProgramId) -> GpuResult<()>;
    /// Activates a program; `None` restores the pass-through state.
    fn use_program(&mut self, program: Option<ProgramId>) -> GpuResult<()>;
    fn active_program(&self) -> Option<ProgramId>;
    fn set_uniform_1f(&mut self, name: &str, value: f32) -> GpuResult<()>;
    fn set_uniform_1fv(&mut self, name: &str, values: &[f32]) -> GpuResult<()>;

    fn bind_texture(&mut self, unit: TextureUnit, texture: Option<TextureId>) -> GpuResult<()>;
    fn clear(&mut self, color: [f32; 4]) -> GpuResult<()>;
    /// Draws the full-screen quad into the bound framebuffer. Without an
    /// active program the quad copies unit `Tex`.
    fn draw_quad(&mut self, transform: QuadTransform) -> GpuResult<()>;
    /// Waits until all submitted work has executed.
    fn flush(&mut self) -> GpuResult<()>;
    /// Shows a texture on the attached window surface, if any.
    fn present(&mut self, texture: TextureId) -> GpuResult<()>;

    fn stats(&self) -> DeviceStats;
}

pub(crate) fn check_size(width: u32, height: u32) -> GpuResult<()> {
    if width == 0 || height == 0 {
        return Err(GpuError::InvalidSize { width, height });
    }
    Ok(())
}

pub(crate) fn check_upload(texture: &Texture, data: &[u8]) -> GpuResult<()> {
    let expected = texture.format.image_bytes(texture.width, texture.height);
    if data.len() != expected {
        return Err(GpuError::UploadSize {
            texture: texture.id,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Expands one texel of `format` to RGBA floats the way samplers do:
/// missing color channels read as 0, missing alpha as 1.
pub(crate) fn decode_texel(format: TextureFormat, bytes: &[u8]) -> [f32; 4] {
    let unorm = |b: u8| b as f32 / 255.0;
    match format {
        TextureFormat::Rgba8 => [
            unorm(bytes[0]),
            unorm(bytes[1]),
            unorm(bytes[2]),
            unorm(bytes[3]),
        ],
        TextureFormat::Rgba16Float => {
            let mut out = [0.0; 4];
            for (c, chunk) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *c = f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            out
        }
        TextureFormat::R8 => [unorm(bytes[0]), 0.0, 0.0, 1.0],
        TextureFormat::Rg8 => [unorm(bytes[0]), unorm(bytes[1]), 0.0, 1.0],
    }
}

/// IEEE 754 binary16 to f32.
pub(crate) fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

/// Converts RGBA floats to 8-bit RGBA bytes, clamping and rounding.
pub fn to_rgba8(texels: &[[f32; 4]]) -> Vec<u8> {
    texels
        .iter()
        .flat_map(|t| t.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f16_decoding() {
        assert_eq!(f16_to_f32(0x3c00), 1.0);
        assert_eq!(f16_to_f32(0x3800), 0.5);
        assert_eq!(f16_to_f32(0xc000), -2.0);
        assert_eq!(f16_to_f32(0x0000), 0.0);
        assert!(f16_to_f32(0x7c00).is_infinite());
        assert!((f16_to_f32(0x0001) - 5.960_464_5e-8).abs() < 1e-12);
    }

    #[test]
    fn test_partial_formats_expand_like_samplers() {
        assert_eq!(decode_texel(TextureFormat::R8, &[255]), [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            decode_texel(TextureFormat::Rg8, &[0, 255]),
            [0.0, 1.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_to_rgba8_clamps() {
        assert_eq!(to_rgba8(&[[1.5, -0.2, 0.5, 1.0]]), vec![255, 0, 128, 255]);
    }
}
