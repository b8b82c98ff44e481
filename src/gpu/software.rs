//! CPU rasterizer implementing [`GpuDevice`].
//!
//! Every program must carry a native fragment kernel; WGSL sources are still
//! parsed and validated so compile and link diagnostics match the hardware
//! device. Float textures are kept at full `f32` precision.

use super::fragment::{passthrough, Fragment, FragmentKernel, TexelView};
use super::{
    check_size, check_upload, decode_texel, DeviceStats, FramebufferId, FramebufferStatus,
    GpuDevice, GpuError, GpuResult, ProgramDesc, ProgramId, QuadTransform, ShaderUniforms,
    Texture, TextureFormat, TextureId, TextureUnit,
};
use crate::shader::{self, ShaderError};
use std::collections::HashMap;
use tracing::{debug, trace};

struct SoftTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    texels: Vec<[f32; 4]>,
}

struct SoftProgram {
    label: String,
    kernel: FragmentKernel,
    uniforms: ShaderUniforms,
}

/// Headless rendering device.
#[derive(Default)]
pub struct SoftwareDevice {
    textures: HashMap<TextureId, SoftTexture>,
    framebuffers: HashMap<FramebufferId, Option<TextureId>>,
    programs: HashMap<ProgramId, SoftProgram>,
    bound_framebuffer: Option<FramebufferId>,
    active_program: Option<ProgramId>,
    units: [Option<TextureId>; 4],
    next_id: u32,
    memory_budget: Option<usize>,
    last_presented: Option<TextureId>,
    stats: DeviceStats,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total bytes of live textures; allocations beyond it fail
    /// with [`GpuError::OutOfMemory`].
    pub fn with_memory_budget(bytes: usize) -> Self {
        Self {
            memory_budget: Some(bytes),
            ..Self::default()
        }
    }

    /// Texture handed to the most recent [`GpuDevice::present`] call.
    pub fn last_presented(&self) -> Option<TextureId> {
        self.last_presented
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, id: TextureId) -> GpuResult<&SoftTexture> {
        self.textures.get(&id).ok_or(GpuError::UnknownTexture(id))
    }

    fn render_target(&self) -> GpuResult<TextureId> {
        let fbo = self.bound_framebuffer.ok_or(GpuError::NoFramebuffer)?;
        match self.framebuffers.get(&fbo) {
            Some(Some(texture)) => Ok(*texture),
            Some(None) => Err(GpuError::Incomplete(FramebufferStatus::MissingAttachment)),
            None => Err(GpuError::UnknownFramebuffer(fbo)),
        }
    }

    fn active_uniforms(&mut self) -> GpuResult<&mut ShaderUniforms> {
        let id = self.active_program.ok_or(GpuError::NoActiveProgram)?;
        self.programs
            .get_mut(&id)
            .map(|p| &mut p.uniforms)
            .ok_or(GpuError::UnknownProgram(id))
    }
}

/// Rounds a color to what `format` can store.
fn quantize(format: TextureFormat, color: [f32; 4]) -> [f32; 4] {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0;
    match format {
        TextureFormat::Rgba8 => color.map(unorm),
        TextureFormat::Rgba16Float => color,
        TextureFormat::R8 => [unorm(color[0]), 0.0, 0.0, 1.0],
        TextureFormat::Rg8 => [unorm(color[0]), unorm(color[1]), 0.0, 1.0],
    }
}

impl GpuDevice for SoftwareDevice {
    fn name(&self) -> &str {
        "software"
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> GpuResult<Texture> {
        check_size(width, height)?;
        let bytes = format.image_bytes(width, height);
        if let Some(budget) = self.memory_budget {
            if self.stats.texture_bytes + bytes > budget {
                return Err(GpuError::OutOfMemory {
                    width,
                    height,
                    format,
                });
            }
        }
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            SoftTexture {
                width,
                height,
                format,
                texels: vec![quantize(format, [0.0; 4]); width as usize * height as usize],
            },
        );
        self.stats.textures_alive += 1;
        self.stats.textures_created += 1;
        self.stats.texture_bytes += bytes;
        trace!("Created {} ({}x{} {:?})", id, width, height, format);
        Ok(Texture {
            id,
            width,
            height,
            format,
        })
    }

    fn delete_texture(&mut self, texture: TextureId) -> GpuResult<()> {
        let tex = self
            .textures
            .remove(&texture)
            .ok_or(GpuError::UnknownTexture(texture))?;
        self.stats.textures_alive -= 1;
        self.stats.texture_bytes -= tex.format.image_bytes(tex.width, tex.height);
        for unit in self.units.iter_mut() {
            if *unit == Some(texture) {
                *unit = None;
            }
        }
        for attachment in self.framebuffers.values_mut() {
            if *attachment == Some(texture) {
                *attachment = None;
            }
        }
        Ok(())
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> GpuResult<()> {
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or(GpuError::UnknownTexture(texture))?;
        let desc = Texture {
            id: texture,
            width: tex.width,
            height: tex.height,
            format: tex.format,
        };
        check_upload(&desc, data)?;
        let step = tex.format.bytes_per_texel();
        for (texel, bytes) in tex.texels.iter_mut().zip(data.chunks_exact(step)) {
            *texel = decode_texel(tex.format, bytes);
        }
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId) -> GpuResult<Vec<[f32; 4]>> {
        Ok(self.texture(texture)?.texels.clone())
    }

    fn create_framebuffer(&mut self) -> GpuResult<FramebufferId> {
        let id = FramebufferId(self.next_id());
        self.framebuffers.insert(id, None);
        self.stats.framebuffers_alive += 1;
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) -> GpuResult<()> {
        self.framebuffers
            .remove(&framebuffer)
            .ok_or(GpuError::UnknownFramebuffer(framebuffer))?;
        self.stats.framebuffers_alive -= 1;
        if self.bound_framebuffer == Some(framebuffer) {
            self.bound_framebuffer = None;
        }
        Ok(())
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) -> GpuResult<()> {
        if let Some(id) = framebuffer {
            if !self.framebuffers.contains_key(&id) {
                return Err(GpuError::UnknownFramebuffer(id));
            }
        }
        self.bound_framebuffer = framebuffer;
        Ok(())
    }

    fn attach_color(&mut self, texture: Option<TextureId>) -> GpuResult<()> {
        let fbo = self.bound_framebuffer.ok_or(GpuError::NoFramebuffer)?;
        if let Some(id) = texture {
            self.texture(id)?;
        }
        let slot = self
            .framebuffers
            .get_mut(&fbo)
            .ok_or(GpuError::UnknownFramebuffer(fbo))?;
        *slot = texture;
        Ok(())
    }

    fn framebuffer_status(&self) -> FramebufferStatus {
        match self.bound_framebuffer.and_then(|fbo| self.framebuffers.get(&fbo)) {
            None => FramebufferStatus::NoFramebuffer,
            Some(None) => FramebufferStatus::MissingAttachment,
            Some(Some(_)) => FramebufferStatus::Complete,
        }
    }

    fn compile_program(&mut self, desc: &ProgramDesc<'_>) -> Result<ProgramId, ShaderError> {
        shader::check_program(desc)?;
        let kernel = desc.kernel.ok_or_else(|| ShaderError::Link {
            label: desc.label.to_string(),
            log: "the software device needs a native fragment kernel".to_string(),
        })?;
        let id = ProgramId(self.next_id());
        self.programs.insert(
            id,
            SoftProgram {
                label: desc.label.to_string(),
                kernel,
                uniforms: ShaderUniforms::default(),
            },
        );
        self.stats.programs_alive += 1;
        self.stats.programs_compiled += 1;
        debug!("Linked {} `{}`", id, desc.label);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) -> GpuResult<()> {
        let removed = self
            .programs
            .remove(&program)
            .ok_or(GpuError::UnknownProgram(program))?;
        trace!("Deleted {} `{}`", program, removed.label);
        self.stats.programs_alive -= 1;
        if self.active_program == Some(program) {
            self.active_program = None;
        }
        Ok(())
    }

    fn use_program(&mut self, program: Option<ProgramId>) -> GpuResult<()> {
        if let Some(id) = program {
            if !self.programs.contains_key(&id) {
                return Err(GpuError::UnknownProgram(id));
            }
        }
        self.active_program = program;
        Ok(())
    }

    fn active_program(&self) -> Option<ProgramId> {
        self.active_program
    }

    fn set_uniform_1f(&mut self, name: &str, value: f32) -> GpuResult<()> {
        self.active_uniforms()?.set_1f(name, value)
    }

    fn set_uniform_1fv(&mut self, name: &str, values: &[f32]) -> GpuResult<()> {
        self.active_uniforms()?.set_1fv(name, values)
    }

    fn bind_texture(&mut self, unit: TextureUnit, texture: Option<TextureId>) -> GpuResult<()> {
        if let Some(id) = texture {
            self.texture(id)?;
        }
        self.units[unit.index()] = texture;
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) -> GpuResult<()> {
        let target = self.render_target()?;
        let tex = self
            .textures
            .get_mut(&target)
            .ok_or(GpuError::UnknownTexture(target))?;
        let value = quantize(tex.format, color);
        tex.texels.iter_mut().for_each(|t| *t = value);
        Ok(())
    }

    fn draw_quad(&mut self, transform: QuadTransform) -> GpuResult<()> {
        let target = self.render_target()?;
        if self.units.contains(&Some(target)) {
            return Err(GpuError::FeedbackLoop(target));
        }
        let (kernel, mut uniforms) = match self.active_program {
            Some(id) => {
                let program = self.programs.get(&id).ok_or(GpuError::UnknownProgram(id))?;
                (program.kernel, program.uniforms)
            }
            None => (passthrough as FragmentKernel, ShaderUniforms::default()),
        };
        uniforms.flip_x = match transform {
            QuadTransform::Identity => 1.0,
            QuadTransform::MirrorX => -1.0,
        };

        let (width, height, format) = {
            let t = self.texture(target)?;
            (t.width, t.height, t.format)
        };
        let views = self.units.map(|unit| {
            unit.and_then(|id| self.textures.get(&id)).map(|t| TexelView {
                width: t.width,
                height: t.height,
                texels: &t.texels,
            })
        });

        let mut out = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let sx = match transform {
                    QuadTransform::Identity => x,
                    QuadTransform::MirrorX => width - 1 - x,
                };
                let frag = Fragment {
                    uv: [
                        (sx as f32 + 0.5) / width as f32,
                        (y as f32 + 0.5) / height as f32,
                    ],
                    uniforms: &uniforms,
                    units: &views,
                };
                out.push(quantize(format, kernel(&frag)));
            }
        }

        if let Some(tex) = self.textures.get_mut(&target) {
            tex.texels = out;
        }
        self.stats.draws += 1;
        Ok(())
    }

    fn flush(&mut self) -> GpuResult<()> {
        self.stats.flushes += 1;
        Ok(())
    }

    fn present(&mut self, texture: TextureId) -> GpuResult<()> {
        self.texture(texture)?;
        self.last_presented = Some(texture);
        self.stats.presents += 1;
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::PASSTHROUGH_FRAGMENT;

    fn invert(f: &Fragment<'_>) -> [f32; 4] {
        let c = f.sample(TextureUnit::Tex, f.uv);
        [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]
    }

    fn target(dev: &mut SoftwareDevice, w: u32, h: u32) -> (FramebufferId, Texture) {
        let tex = dev.create_texture(w, h, TextureFormat::Rgba8).unwrap();
        let fbo = dev.create_framebuffer().unwrap();
        dev.bind_framebuffer(Some(fbo)).unwrap();
        dev.attach_color(Some(tex.id)).unwrap();
        (fbo, tex)
    }

    #[test]
    fn test_framebuffer_status_tracks_attachment() {
        let mut dev = SoftwareDevice::new();
        assert_eq!(dev.framebuffer_status(), FramebufferStatus::NoFramebuffer);
        let fbo = dev.create_framebuffer().unwrap();
        dev.bind_framebuffer(Some(fbo)).unwrap();
        assert_eq!(dev.framebuffer_status(), FramebufferStatus::MissingAttachment);
        let tex = dev.create_texture(2, 2, TextureFormat::Rgba8).unwrap();
        dev.attach_color(Some(tex.id)).unwrap();
        assert_eq!(dev.framebuffer_status(), FramebufferStatus::Complete);
        dev.delete_texture(tex.id).unwrap();
        assert_eq!(dev.framebuffer_status(), FramebufferStatus::MissingAttachment);
    }

    #[test]
    fn test_draw_without_program_copies_input() {
        let mut dev = SoftwareDevice::new();
        let input = dev.create_texture(2, 1, TextureFormat::Rgba8).unwrap();
        dev.upload_texture(input.id, &[255, 0, 0, 255, 0, 0, 255, 255])
            .unwrap();
        let (_, out) = target(&mut dev, 2, 1);
        dev.bind_texture(TextureUnit::Tex, Some(input.id)).unwrap();
        dev.draw_quad(QuadTransform::Identity).unwrap();
        let px = dev.read_texture(out.id).unwrap();
        assert_eq!(px, vec![[1.0, 0.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]]);

        dev.draw_quad(QuadTransform::MirrorX).unwrap();
        let px = dev.read_texture(out.id).unwrap();
        assert_eq!(px, vec![[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_program_kernel_runs() {
        let mut dev = SoftwareDevice::new();
        let input = dev.create_texture(1, 1, TextureFormat::Rgba8).unwrap();
        dev.upload_texture(input.id, &[0, 255, 51, 255]).unwrap();
        let (_, out) = target(&mut dev, 1, 1);
        let program = dev
            .compile_program(&ProgramDesc {
                label: "invert",
                vertex: None,
                fragment: PASSTHROUGH_FRAGMENT,
                kernel: Some(invert),
            })
            .unwrap();
        dev.use_program(Some(program)).unwrap();
        dev.bind_texture(TextureUnit::Tex, Some(input.id)).unwrap();
        dev.draw_quad(QuadTransform::Identity).unwrap();
        let px = dev.read_texture(out.id).unwrap();
        assert_eq!(crate::gpu::to_rgba8(&px), vec![255, 0, 204, 255]);
    }

    #[test]
    fn test_missing_kernel_fails_link() {
        let mut dev = SoftwareDevice::new();
        let err = dev
            .compile_program(&ProgramDesc {
                label: "user",
                vertex: None,
                fragment: PASSTHROUGH_FRAGMENT,
                kernel: None,
            })
            .unwrap_err();
        assert!(matches!(err, ShaderError::Link { .. }));
        assert_eq!(dev.stats().programs_alive, 0);
    }

    #[test]
    fn test_uniforms_need_active_program() {
        let mut dev = SoftwareDevice::new();
        assert!(matches!(
            dev.set_uniform_1f("width", 1.0),
            Err(GpuError::NoActiveProgram)
        ));
    }

    #[test]
    fn test_feedback_loop_rejected() {
        let mut dev = SoftwareDevice::new();
        let (_, out) = target(&mut dev, 2, 2);
        dev.bind_texture(TextureUnit::Tex, Some(out.id)).unwrap();
        assert!(matches!(
            dev.draw_quad(QuadTransform::Identity),
            Err(GpuError::FeedbackLoop(id)) if id == out.id
        ));
    }

    #[test]
    fn test_memory_budget() {
        let mut dev = SoftwareDevice::with_memory_budget(64);
        let a = dev.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
        assert!(matches!(
            dev.create_texture(1, 1, TextureFormat::R8),
            Err(GpuError::OutOfMemory { .. })
        ));
        dev.delete_texture(a.id).unwrap();
        assert!(dev.create_texture(2, 2, TextureFormat::Rgba8).is_ok());
        assert_eq!(dev.stats().textures_created, 2);
    }

    #[test]
    fn test_upload_size_checked() {
        let mut dev = SoftwareDevice::new();
        let tex = dev.create_texture(2, 2, TextureFormat::R8).unwrap();
        assert!(matches!(
            dev.upload_texture(tex.id, &[0; 3]),
            Err(GpuError::UploadSize { expected: 4, actual: 3, .. })
        ));
    }
}
