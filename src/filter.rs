//! Single-pass texture filters.
//!
//! [`FilterStage`] owns the per-frame boilerplate every one-pass filter
//! shares: it takes the display context scope, renders into the output
//! through a scratch framebuffer with the input bound on unit `Tex`, and
//! flushes. The filter itself only issues its draw.

use crate::display::{ContextError, DisplayContext};
use crate::gpu::{
    FragmentKernel, FramebufferId, FramebufferStatus, GpuDevice, GpuError, QuadTransform, Texture,
    TextureUnit,
};
use crate::shader::{ShaderError, ShaderProgram, ShaderSource};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Background the output is cleared to before the filter draws.
pub const CLEAR_COLOR: [f32; 4] = [0.3, 0.3, 0.3, 1.0];

#[derive(Debug, Error)]
pub enum FilterError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
}

/// The state a filter renders with. The output is already attached to the
/// bound framebuffer and the input bound to unit `Tex`.
pub struct FilterPass<'a> {
    pub gpu: &'a mut dyn GpuDevice,
    pub input: &'a Texture,
    pub output: &'a Texture,
}

pub trait Filter: Send {
    fn name(&self) -> &str;

    /// Called once with the scope held, before the first frame.
    fn start(&mut self, _gpu: &mut dyn GpuDevice) -> Result<(), FilterError> {
        Ok(())
    }

    fn filter(&mut self, pass: &mut FilterPass<'_>) -> Result<(), FilterError>;

    /// Releases GPU objects. Called with the scope held.
    fn stop(&mut self, _gpu: &mut dyn GpuDevice) {}
}

pub struct FilterStage<F> {
    filter: F,
    started: bool,
}

impl<F: Filter> FilterStage<F> {
    pub fn new(filter: F) -> Self {
        Self {
            filter,
            started: false,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    /// Renders `input` into `output` under the context scope.
    pub fn transform(
        &mut self,
        ctx: &DisplayContext,
        input: &Texture,
        output: &Texture,
    ) -> Result<(), FilterError> {
        let mut guard = ctx.acquire()?;
        self.apply(guard.gpu(), input, output)
    }

    /// Like [`FilterStage::transform`] for callers already holding the scope.
    pub fn apply(
        &mut self,
        gpu: &mut dyn GpuDevice,
        input: &Texture,
        output: &Texture,
    ) -> Result<(), FilterError> {
        if !self.started {
            self.filter.start(gpu)?;
            self.started = true;
            info!("Started filter `{}`", self.filter.name());
        }

        let fbo = gpu.create_framebuffer()?;
        let result = self.render(gpu, fbo, input, output);
        let cleanup = release_target(gpu, fbo);
        if let (Err(_), Err(e)) = (&result, &cleanup) {
            warn!("Cleanup after failed filter `{}`: {}", self.filter.name(), e);
        }
        result.and(cleanup)
    }

    fn render(
        &mut self,
        gpu: &mut dyn GpuDevice,
        fbo: FramebufferId,
        input: &Texture,
        output: &Texture,
    ) -> Result<(), FilterError> {
        gpu.bind_framebuffer(Some(fbo))?;
        gpu.attach_color(Some(output.id))?;
        let status = gpu.framebuffer_status();
        assert_eq!(
            status,
            FramebufferStatus::Complete,
            "filter `{}` framebuffer is incomplete",
            self.filter.name()
        );
        gpu.clear(CLEAR_COLOR)?;
        gpu.bind_texture(TextureUnit::Tex, Some(input.id))?;

        let mut pass = FilterPass {
            gpu: &mut *gpu,
            input,
            output,
        };
        self.filter.filter(&mut pass)?;
        gpu.flush()?;
        Ok(())
    }

    pub fn stop(&mut self, ctx: &DisplayContext) -> Result<(), FilterError> {
        let mut guard = ctx.acquire()?;
        self.stop_with(guard.gpu());
        Ok(())
    }

    pub fn stop_with(&mut self, gpu: &mut dyn GpuDevice) {
        if self.started {
            self.filter.stop(gpu);
            self.started = false;
            debug!("Stopped filter `{}`", self.filter.name());
        }
    }
}

/// Unbinds the input and deletes the scratch framebuffer. Every step runs
/// even if an earlier one fails; the first error is returned.
fn release_target(gpu: &mut dyn GpuDevice, fbo: FramebufferId) -> Result<(), FilterError> {
    let unbound = gpu.bind_texture(TextureUnit::Tex, None);
    let detached = gpu.bind_framebuffer(None);
    let deleted = gpu.delete_framebuffer(fbo);
    Ok(unbound.and(detached).and(deleted)?)
}

/// Runs one user-supplied fragment shader over the input.
///
/// A shader that fails to compile is logged once and the filter copies its
/// input until a working source is set.
pub struct ShaderFilter {
    program: ShaderProgram,
    failed: bool,
}

impl ShaderFilter {
    pub fn new(
        label: &str,
        source: impl Into<ShaderSource>,
        kernel: Option<FragmentKernel>,
    ) -> Result<Self, ShaderError> {
        let mut program = ShaderProgram::new(label);
        program.set_fragment_source(source)?;
        program.set_kernel(kernel);
        Ok(Self {
            program,
            failed: false,
        })
    }

    /// Swaps the fragment source. The next frame recompiles.
    pub fn set_source(&mut self, source: impl Into<ShaderSource>) -> Result<(), ShaderError> {
        self.program.set_fragment_source(source)?;
        self.failed = false;
        Ok(())
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    fn select(&mut self, gpu: &mut dyn GpuDevice) -> Result<bool, ShaderError> {
        if !self.failed {
            match self.program.compile_and_link(gpu) {
                Ok(()) => {
                    self.program.use_program(gpu)?;
                    return Ok(true);
                }
                Err(e) => {
                    warn!("{}; falling back", e);
                    self.failed = true;
                }
            }
        }
        if self.program.use_last_good(gpu).is_ok() {
            return Ok(true);
        }
        ShaderProgram::use_none(gpu)?;
        Ok(false)
    }
}

impl Filter for ShaderFilter {
    fn name(&self) -> &str {
        self.program.label()
    }

    fn start(&mut self, gpu: &mut dyn GpuDevice) -> Result<(), FilterError> {
        if let Err(e) = self.program.compile_and_link(gpu) {
            warn!("{}; the filter copies its input", e);
            self.failed = true;
        }
        Ok(())
    }

    fn filter(&mut self, pass: &mut FilterPass<'_>) -> Result<(), FilterError> {
        if self.select(pass.gpu)? {
            let gpu = &mut *pass.gpu;
            gpu.set_uniform_1f("width", pass.output.width as f32)?;
            gpu.set_uniform_1f("height", pass.output.height as f32)?;
        }
        pass.gpu.draw_quad(QuadTransform::Identity)?;
        ShaderProgram::use_none(pass.gpu)?;
        Ok(())
    }

    fn stop(&mut self, gpu: &mut dyn GpuDevice) {
        self.program.release(gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::ContextConfig;
    use crate::gpu::{to_rgba8, Fragment, SoftwareDevice, TextureFormat};
    use crate::shader::{with_prelude, PASSTHROUGH_FRAGMENT};

    const INVERT: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let c = textureSample(t_tex, s_sampler, uv);
    return vec4<f32>(1.0 - c.rgb, c.a);
}
"#;

    fn invert(f: &Fragment<'_>) -> [f32; 4] {
        let c = f.sample(TextureUnit::Tex, f.uv);
        [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]
    }

    fn textures(gpu: &mut dyn GpuDevice) -> (Texture, Texture) {
        let input = gpu.create_texture(2, 1, TextureFormat::Rgba8).unwrap();
        gpu.upload_texture(input.id, &[255, 0, 0, 255, 0, 255, 0, 255])
            .unwrap();
        let output = gpu.create_texture(2, 1, TextureFormat::Rgba8).unwrap();
        (input, output)
    }

    #[test]
    fn test_shader_filter_renders() {
        let ctx = DisplayContext::headless(ContextConfig::default()).unwrap();
        let filter = ShaderFilter::new("invert", with_prelude(INVERT), Some(invert)).unwrap();
        let mut stage = FilterStage::new(filter);

        let (input, output) = textures(ctx.acquire().unwrap().gpu());
        stage.transform(&ctx, &input, &output).unwrap();

        let mut guard = ctx.acquire().unwrap();
        let pixels = to_rgba8(&guard.gpu().read_texture(output.id).unwrap());
        assert_eq!(pixels, vec![0, 255, 255, 255, 255, 0, 255, 255]);
        assert_eq!(guard.gpu().stats().framebuffers_alive, 0);
        assert_eq!(guard.gpu().active_program(), None);
    }

    #[test]
    fn test_broken_shader_copies_input() {
        let ctx = DisplayContext::headless(ContextConfig::default()).unwrap();
        let filter =
            ShaderFilter::new("broken", with_prelude("@fragment fn fs_main( {"), Some(invert))
                .unwrap();
        let mut stage = FilterStage::new(filter);

        let (input, output) = textures(ctx.acquire().unwrap().gpu());
        stage.transform(&ctx, &input, &output).unwrap();

        let mut guard = ctx.acquire().unwrap();
        let pixels = to_rgba8(&guard.gpu().read_texture(output.id).unwrap());
        assert_eq!(pixels, vec![255, 0, 0, 255, 0, 255, 0, 255]);
    }

    #[test]
    fn test_fixed_source_recovers() {
        let ctx = DisplayContext::headless(ContextConfig::default()).unwrap();
        let filter =
            ShaderFilter::new("live", with_prelude("@fragment fn fs_main( {"), Some(invert))
                .unwrap();
        let mut stage = FilterStage::new(filter);
        let (input, output) = textures(ctx.acquire().unwrap().gpu());
        stage.transform(&ctx, &input, &output).unwrap();

        stage
            .filter_mut()
            .set_source(with_prelude(INVERT))
            .unwrap();
        stage.transform(&ctx, &input, &output).unwrap();
        assert!(stage.filter().program().is_compiled());

        let mut guard = ctx.acquire().unwrap();
        let pixels = to_rgba8(&guard.gpu().read_texture(output.id).unwrap());
        assert_eq!(&pixels[..4], &[0, 255, 255, 255]);
    }

    /// Fails after deleting the stage's scratch framebuffer, so cleanup
    /// fails too.
    struct Wrecker;

    impl Filter for Wrecker {
        fn name(&self) -> &str {
            "wrecker"
        }

        fn filter(&mut self, pass: &mut FilterPass<'_>) -> Result<(), FilterError> {
            // Ids are sequential: the stage's framebuffer precedes this one.
            let next = pass.gpu.create_framebuffer()?;
            pass.gpu.delete_framebuffer(next)?;
            pass.gpu.delete_framebuffer(FramebufferId(next.0 - 1))?;
            Err(ShaderError::NotCompiled("wrecker".to_string()).into())
        }
    }

    #[test]
    fn test_filter_error_wins_over_cleanup_error() {
        let mut gpu = SoftwareDevice::new();
        let (input, output) = textures(&mut gpu);
        let mut stage = FilterStage::new(Wrecker);

        let result = stage.apply(&mut gpu, &input, &output);
        assert!(matches!(
            result,
            Err(FilterError::Shader(ShaderError::NotCompiled(_)))
        ));
        // Cleanup still ran every step.
        assert_eq!(gpu.stats().framebuffers_alive, 0);
        assert!(matches!(
            gpu.framebuffer_status(),
            FramebufferStatus::NoFramebuffer
        ));
    }

    #[test]
    fn test_stop_releases_program() {
        let ctx = DisplayContext::headless(ContextConfig::default()).unwrap();
        let filter = ShaderFilter::new(
            "copy",
            with_prelude(PASSTHROUGH_FRAGMENT),
            Some(invert),
        )
        .unwrap();
        let mut stage = FilterStage::new(filter);
        let (input, output) = textures(ctx.acquire().unwrap().gpu());
        stage.transform(&ctx, &input, &output).unwrap();
        stage.stop(&ctx).unwrap();
        assert_eq!(ctx.acquire().unwrap().gpu().stats().programs_alive, 0);
    }
}
