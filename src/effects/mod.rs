//! The multi-pass effect engine.
//!
//! [`EffectEngine`] turns an input texture into an output texture by
//! running the passes of the selected [`Effect`] against offscreen targets.
//! Every pass goes through one primitive: attach the target, select the
//! program for a [`Kernel`] (compiling it on first use), bind the inputs,
//! set uniforms and draw. Intermediate results live in scratch textures
//! owned by the engine; only the final pass writes the caller's output and
//! only that pass is mirrored.
//!
//! Properties are changed through [`EffectControls`] from any thread. The
//! engine reads them once at the start of each frame.

pub mod background;
pub mod curves;
pub mod kernels;

pub use background::{BackgroundCapture, BackgroundImage, CaptureError};
pub use curves::Curve;
pub use kernels::Kernel;

use crate::display::{ContextError, DisplayContext};
use crate::gpu::{
    FramebufferId, FramebufferStatus, GpuDevice, GpuError, QuadTransform, Texture, TextureFormat,
    TextureId, TextureUnit,
};
use crate::shader::{ShaderError, ShaderProgram, ShaderSource};
use background::BackgroundRequest;
use curves::CURVE_LEN;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Intermediate render targets kept by the engine.
pub const SCRATCH_COUNT: usize = 2;
/// Color distance below which a pixel counts as background.
pub const DEFAULT_MATTE_THRESHOLD: f32 = 0.15;
/// Frames to wait before snapshotting the reference background, so the
/// subject has time to step out of the picture.
pub const DEFAULT_CAPTURE_DELAY: u32 = 5;

/// Selectable effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    #[default]
    Identity,
    Mirror,
    Squeeze,
    Stretch,
    Tunnel,
    Fisheye,
    Twirl,
    Bulge,
    Square,
    Heat,
    Cross,
    Sepia,
    Emboss,
    Sobel,
    Blur,
    Glow,
    Background,
}

impl Effect {
    pub const ALL: [Effect; 17] = [
        Effect::Identity,
        Effect::Mirror,
        Effect::Squeeze,
        Effect::Stretch,
        Effect::Tunnel,
        Effect::Fisheye,
        Effect::Twirl,
        Effect::Bulge,
        Effect::Square,
        Effect::Heat,
        Effect::Cross,
        Effect::Sepia,
        Effect::Emboss,
        Effect::Sobel,
        Effect::Blur,
        Effect::Glow,
        Effect::Background,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Effect::Identity => "identity",
            Effect::Mirror => "mirror",
            Effect::Squeeze => "squeeze",
            Effect::Stretch => "stretch",
            Effect::Tunnel => "tunnel",
            Effect::Fisheye => "fisheye",
            Effect::Twirl => "twirl",
            Effect::Bulge => "bulge",
            Effect::Square => "square",
            Effect::Heat => "heat",
            Effect::Cross => "cross",
            Effect::Sepia => "sepia",
            Effect::Emboss => "emboss",
            Effect::Sobel => "sobel",
            Effect::Blur => "blur",
            Effect::Glow => "glow",
            Effect::Background => "background",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Effect::Identity => "Copy the input unchanged",
            Effect::Mirror => "Reflect the right half onto the left",
            Effect::Squeeze => "Squeeze towards the centre",
            Effect::Stretch => "Stretch the centre outwards",
            Effect::Tunnel => "Light tunnel",
            Effect::Fisheye => "Fisheye lens",
            Effect::Twirl => "Twirl around the centre",
            Effect::Bulge => "Bulge the centre",
            Effect::Square => "Square tunnel",
            Effect::Heat => "Heat signature",
            Effect::Cross => "Cross processing",
            Effect::Sepia => "Sepia toning",
            Effect::Emboss => "Emboss",
            Effect::Sobel => "Sobel edge detection",
            Effect::Blur => "Gaussian blur",
            Effect::Glow => "Glow lighting",
            Effect::Background => "Replace a static background",
        }
    }

    /// Kernel of the single-pass warps.
    fn warp_kernel(self) -> Option<Kernel> {
        Some(match self {
            Effect::Identity => kernels::IDENTITY,
            Effect::Mirror => kernels::MIRROR,
            Effect::Squeeze => kernels::SQUEEZE,
            Effect::Stretch => kernels::STRETCH,
            Effect::Tunnel => kernels::TUNNEL,
            Effect::Fisheye => kernels::FISHEYE,
            Effect::Twirl => kernels::TWIRL,
            Effect::Bulge => kernels::BULGE,
            Effect::Square => kernels::SQUARE,
            _ => return None,
        })
    }

    fn curve(self) -> Option<Curve> {
        match self {
            Effect::Heat => Some(Curve::Heat),
            Effect::Cross => Some(Curve::Cross),
            Effect::Sepia => Some(Curve::Sepia),
            _ => None,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Effect::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown effect `{}`", s))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error("input is {input:?} but output is {output:?}")]
    SizeMismatch {
        input: (u32, u32),
        output: (u32, u32),
    },
}

struct Properties {
    effect: Effect,
    mirrored: bool,
    matte_threshold: f32,
    capture_delay: u32,
    background: Option<BackgroundRequest>,
    overrides: HashMap<String, ShaderSource>,
    overrides_version: u64,
}

/// Thread-safe property API of an [`EffectEngine`]. Clones share state.
#[derive(Clone)]
pub struct EffectControls {
    props: Arc<Mutex<Properties>>,
}

impl Default for EffectControls {
    fn default() -> Self {
        Self {
            props: Arc::new(Mutex::new(Properties {
                effect: Effect::default(),
                mirrored: false,
                matte_threshold: DEFAULT_MATTE_THRESHOLD,
                capture_delay: DEFAULT_CAPTURE_DELAY,
                background: None,
                overrides: HashMap::new(),
                overrides_version: 0,
            })),
        }
    }
}

impl EffectControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Properties> {
        self.props.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn effect(&self) -> Effect {
        self.lock().effect
    }

    pub fn set_effect(&self, effect: Effect) {
        let mut props = self.lock();
        if props.effect != effect {
            info!("Effect changed: {} -> {}", props.effect, effect);
            props.effect = effect;
        }
    }

    pub fn is_mirrored(&self) -> bool {
        self.lock().mirrored
    }

    pub fn set_mirrored(&self, mirrored: bool) {
        self.lock().mirrored = mirrored;
    }

    pub fn matte_threshold(&self) -> f32 {
        self.lock().matte_threshold
    }

    pub fn set_matte_threshold(&self, threshold: f32) {
        self.lock().matte_threshold = threshold;
    }

    pub fn capture_delay(&self) -> u32 {
        self.lock().capture_delay
    }

    /// Frames the engine waits after [`EffectControls::set_background`]
    /// before it captures the reference frame.
    pub fn set_capture_delay(&self, frames: u32) {
        self.lock().capture_delay = frames;
    }

    /// Requests a new replacement background. A request still pending is
    /// cancelled.
    pub fn set_background(&self, image: BackgroundImage) -> BackgroundCapture {
        let (done, capture) = BackgroundCapture::channel();
        let mut props = self.lock();
        props.background = Some(BackgroundRequest {
            image,
            frames_left: props.capture_delay,
            done: Some(done),
        });
        capture
    }

    /// Replaces the fragment program of the pass named `key` (see
    /// [`kernels::ALL`]). WGSL sources are fragment bodies completed with
    /// the shared declarations; GLSL sources are used as they are.
    pub fn set_shader_override(&self, key: &str, source: ShaderSource) {
        let mut props = self.lock();
        props.overrides.insert(key.to_string(), source);
        props.overrides_version += 1;
    }

    pub fn clear_shader_override(&self, key: &str) {
        let mut props = self.lock();
        if props.overrides.remove(key).is_some() {
            props.overrides_version += 1;
        }
    }

    fn snapshot(&self, overrides_seen: u64) -> Snapshot {
        let mut props = self.lock();
        let overrides = (props.overrides_version != overrides_seen)
            .then(|| (props.overrides_version, props.overrides.clone()));
        Snapshot {
            effect: props.effect,
            mirrored: props.mirrored,
            matte_threshold: props.matte_threshold,
            background: props.background.take(),
            overrides,
        }
    }
}

/// Properties as seen by one frame.
struct Snapshot {
    effect: Effect,
    mirrored: bool,
    matte_threshold: f32,
    background: Option<BackgroundRequest>,
    overrides: Option<(u64, HashMap<String, ShaderSource>)>,
}


/// Instance-owned program cache keyed by pass.
#[derive(Default)]
struct ShaderCache {
    programs: HashMap<&'static str, ShaderProgram>,
    overrides: HashMap<String, ShaderSource>,
    /// Fragment source of the last failed build per key, so a broken
    /// program is not rebuilt every frame.
    failed: HashMap<&'static str, ShaderSource>,
    /// Keys whose override source was refused before compilation.
    rejected: HashSet<&'static str>,
}

/// Gives `program` the override source for `kernel`, or the built-in one.
fn configure(
    overrides: &HashMap<String, ShaderSource>,
    kernel: Kernel,
    program: &mut ShaderProgram,
) -> Result<(), ShaderError> {
    match overrides.get(kernel.key) {
        Some(ShaderSource::Wgsl(body)) => {
            program.set_fragment_source(kernels::wrap_body(body))?;
            program.set_kernel(None);
        }
        Some(glsl @ ShaderSource::Glsl(_)) => {
            program.set_fragment_source(glsl.clone())?;
            program.set_kernel(None);
        }
        None => {
            program.set_fragment_source(kernel.source())?;
            program.set_kernel(Some(kernel.native));
        }
    }
    Ok(())
}

impl ShaderCache {
    /// Installs `overrides`. A refused source leaves its pass on the last
    /// good build, or pass-through.
    fn set_overrides(&mut self, overrides: HashMap<String, ShaderSource>) {
        for key in overrides.keys() {
            if kernels::by_key(key).is_none() {
                warn!("Ignoring shader override for unknown pass `{}`", key);
            }
        }
        for (key, program) in self.programs.iter_mut() {
            if overrides.get(*key) == self.overrides.get(*key) {
                continue;
            }
            if let Some(kernel) = kernels::by_key(key) {
                info!("Reloading shader `{}`", key);
                self.failed.remove(kernel.key);
                self.rejected.remove(kernel.key);
                if let Err(e) = configure(&overrides, kernel, program) {
                    warn!("Shader override for `{}` refused: {}", kernel.key, e);
                    self.rejected.insert(kernel.key);
                }
            }
        }
        self.overrides = overrides;
    }

    /// Activates the program for `kernel`, compiling it when needed.
    ///
    /// A program that fails to build falls back to its last good build.
    /// Without one, the pass-through state is activated and `None` returned.
    fn select(
        &mut self,
        gpu: &mut dyn GpuDevice,
        kernel: Kernel,
    ) -> Result<Option<&ShaderProgram>, ShaderError> {
        if !self.programs.contains_key(kernel.key) {
            let mut program = ShaderProgram::new(kernel.key);
            if let Err(e) = configure(&self.overrides, kernel, &mut program) {
                warn!("Shader override for `{}` refused: {}", kernel.key, e);
                self.rejected.insert(kernel.key);
            }
            self.programs.insert(kernel.key, program);
        }
        let Some(program) = self.programs.get_mut(kernel.key) else {
            unreachable!("program `{}` was just cached", kernel.key);
        };

        let known_bad = self.rejected.contains(kernel.key)
            || self
                .failed
                .get(kernel.key)
                .is_some_and(|bad| program.fragment_source() == Some(bad));
        if !known_bad {
            match program.compile_and_link(gpu) {
                Ok(()) => {
                    self.failed.remove(kernel.key);
                    program.use_program(gpu)?;
                    return Ok(Some(&*program));
                }
                Err(e) => {
                    warn!("{}", e);
                    if let Some(source) = program.fragment_source() {
                        self.failed.insert(kernel.key, source.clone());
                    }
                }
            }
        }

        if program.use_last_good(gpu).is_ok() {
            trace!("Using last good build of `{}`", kernel.key);
            return Ok(Some(&*program));
        }
        trace!("No program for `{}`, passing through", kernel.key);
        ShaderProgram::use_none(gpu)?;
        Ok(None)
    }

    fn release(&mut self, gpu: &mut dyn GpuDevice) {
        for (_, mut program) in self.programs.drain() {
            program.release(gpu);
        }
        self.failed.clear();
        self.rejected.clear();
    }
}

/// Uniform setter handed to a pass.
struct PassUniforms<'a> {
    gpu: &'a mut dyn GpuDevice,
    program: &'a ShaderProgram,
}

impl PassUniforms<'_> {
    fn set_1f(&mut self, name: &str, value: f32) -> Result<(), ShaderError> {
        self.program.set_uniform_1f(self.gpu, name, value)
    }

    fn set_1fv(&mut self, name: &str, values: &[f32]) -> Result<(), ShaderError> {
        self.program.set_uniform_1fv(self.gpu, name, values)
    }
}

type UniformResult = Result<(), ShaderError>;

fn no_uniforms(_: &mut PassUniforms<'_>) -> UniformResult {
    Ok(())
}

fn gaussian_h(u: &mut PassUniforms<'_>) -> UniformResult {
    u.set_1fv("hkern", &kernels::GAUSSIAN_9)?;
    u.set_1f("norm_const", kernels::GAUSSIAN_NORM)
}

fn gaussian_v(u: &mut PassUniforms<'_>) -> UniformResult {
    u.set_1fv("vkern", &kernels::GAUSSIAN_9)?;
    u.set_1f("norm_const", kernels::GAUSSIAN_NORM)
}

fn emboss(u: &mut PassUniforms<'_>) -> UniformResult {
    u.set_1fv("kernel", &kernels::EMBOSS_3X3)?;
    u.set_1f("norm_const", 1.0)?;
    u.set_1f("norm_offset", kernels::EMBOSS_OFFSET)
}

fn sobel(u: &mut PassUniforms<'_>) -> UniformResult {
    u.set_1fv("hkern", &kernels::SOBEL_H)?;
    u.set_1fv("vkern", &kernels::SOBEL_V)
}

/// Runs passes against the engine framebuffer.
struct Passes<'a> {
    shaders: &'a mut ShaderCache,
    width: u32,
    height: u32,
}

impl Passes<'_> {
    /// One shader pass: `inputs` are bound to their units (all other units
    /// are cleared) and `kernel` draws into `target`.
    fn run(
        &mut self,
        gpu: &mut dyn GpuDevice,
        kernel: Kernel,
        target: &Texture,
        inputs: &[(TextureUnit, TextureId)],
        transform: QuadTransform,
        uniforms: impl FnOnce(&mut PassUniforms<'_>) -> UniformResult,
    ) -> Result<(), EngineError> {
        gpu.attach_color(Some(target.id))?;
        let status = gpu.framebuffer_status();
        assert_eq!(
            status,
            FramebufferStatus::Complete,
            "framebuffer for pass `{}` is incomplete",
            kernel.key
        );
        for unit in TextureUnit::ALL {
            let bound = inputs.iter().find(|(u, _)| *u == unit).map(|(_, id)| *id);
            gpu.bind_texture(unit, bound)?;
        }

        if let Some(program) = self.shaders.select(gpu, kernel)? {
            let mut setter = PassUniforms {
                gpu: &mut *gpu,
                program,
            };
            setter.set_1f("width", self.width as f32)?;
            setter.set_1f("height", self.height as f32)?;
            uniforms(&mut setter)?;
        }
        gpu.draw_quad(transform)?;
        Ok(())
    }

    /// Separable Gaussian: `input` -> `scratch` horizontally, then into
    /// `target` vertically.
    fn blur(
        &mut self,
        gpu: &mut dyn GpuDevice,
        input: TextureId,
        scratch: &Texture,
        target: &Texture,
        transform: QuadTransform,
    ) -> Result<(), EngineError> {
        use TextureUnit::Tex;
        let identity = QuadTransform::Identity;
        self.run(gpu, kernels::HCONV9, scratch, &[(Tex, input)], identity, gaussian_h)?;
        self.run(gpu, kernels::VCONV9, target, &[(Tex, scratch.id)], transform, gaussian_v)
    }
}

/// GPU objects sized to the current stream.
struct Resources {
    width: u32,
    height: u32,
    fbo: FramebufferId,
    scratch: Vec<Texture>,
    curves: HashMap<Curve, Texture>,
    /// Reference frame the matte is computed against.
    saved: Option<Texture>,
    /// Picture shown where the reference frame is visible.
    replacement: Option<Texture>,
}

impl Resources {
    fn allocate(gpu: &mut dyn GpuDevice, width: u32, height: u32) -> Result<Self, GpuError> {
        let mut scratch = Vec::with_capacity(SCRATCH_COUNT);
        for _ in 0..SCRATCH_COUNT {
            match gpu.create_texture(width, height, TextureFormat::Rgba16Float) {
                Ok(texture) => scratch.push(texture),
                Err(e) => {
                    delete_textures(gpu, scratch);
                    return Err(e);
                }
            }
        }
        let fbo = match gpu.create_framebuffer() {
            Ok(fbo) => fbo,
            Err(e) => {
                delete_textures(gpu, scratch);
                return Err(e);
            }
        };
        Ok(Self {
            width,
            height,
            fbo,
            scratch,
            curves: HashMap::new(),
            saved: None,
            replacement: None,
        })
    }

    fn curve(&mut self, gpu: &mut dyn GpuDevice, curve: Curve) -> Result<TextureId, GpuError> {
        if let Some(texture) = self.curves.get(&curve) {
            return Ok(texture.id);
        }
        let texture = gpu.create_texture(CURVE_LEN, 1, TextureFormat::Rgba8)?;
        if let Err(e) = gpu.upload_texture(texture.id, &curve.table()) {
            let _ = gpu.delete_texture(texture.id);
            return Err(e);
        }
        debug!("Uploaded {:?} curve", curve);
        self.curves.insert(curve, texture);
        Ok(texture.id)
    }

    /// Returns the texture in `slot`, creating it on first use.
    fn frame_texture(
        gpu: &mut dyn GpuDevice,
        slot: &mut Option<Texture>,
        width: u32,
        height: u32,
    ) -> Result<Texture, GpuError> {
        if let Some(texture) = slot {
            return Ok(*texture);
        }
        let texture = gpu.create_texture(width, height, TextureFormat::Rgba8)?;
        *slot = Some(texture);
        Ok(texture)
    }

    fn release(self, gpu: &mut dyn GpuDevice) {
        let mut textures = self.scratch;
        textures.extend(self.curves.into_values());
        textures.extend(self.saved);
        textures.extend(self.replacement);
        delete_textures(gpu, textures);
        if let Err(e) = gpu.delete_framebuffer(self.fbo) {
            debug!("Deleting engine framebuffer failed: {}", e);
        }
    }
}

fn delete_textures(gpu: &mut dyn GpuDevice, textures: Vec<Texture>) {
    for texture in textures {
        if let Err(e) = gpu.delete_texture(texture.id) {
            debug!("Deleting engine texture failed: {}", e);
        }
    }
}

/// Applies the selected effect to frames.
///
/// GPU objects are created on the first frame once the size is known,
/// recreated when the size changes and released by
/// [`EffectEngine::stop`].
pub struct EffectEngine {
    controls: EffectControls,
    shaders: ShaderCache,
    overrides_seen: u64,
    resources: Option<Resources>,
    pending: Option<BackgroundRequest>,
    /// Last applied background, captured again after a resize.
    background: Option<BackgroundImage>,
    frames: u64,
}

impl EffectEngine {
    pub fn new(controls: EffectControls) -> Self {
        Self {
            controls,
            shaders: ShaderCache::default(),
            overrides_seen: 0,
            resources: None,
            pending: None,
            background: None,
            frames: 0,
        }
    }

    pub fn controls(&self) -> &EffectControls {
        &self.controls
    }

    /// Frames rendered since creation.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Size the GPU objects are allocated for.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.resources.as_ref().map(|r| (r.width, r.height))
    }

    pub fn has_background(&self) -> bool {
        self.resources
            .as_ref()
            .is_some_and(|r| r.saved.is_some() && r.replacement.is_some())
    }

    /// Renders one frame under the context scope.
    pub fn transform(
        &mut self,
        ctx: &DisplayContext,
        input: &Texture,
        output: &Texture,
    ) -> Result<(), EngineError> {
        let mut guard = ctx.acquire()?;
        self.render(guard.gpu(), input, output)
    }

    /// Renders the context's current frame into `output` and returns its
    /// sequence number, or `None` when no frame has been promoted yet.
    pub fn transform_current(
        &mut self,
        ctx: &DisplayContext,
        output: &Texture,
    ) -> Result<Option<u64>, EngineError> {
        let mut guard = ctx.acquire()?;
        let Some(current) = guard.current_frame().cloned() else {
            return Ok(None);
        };
        self.render(guard.gpu(), current.textures.primary(), output)?;
        Ok(Some(current.seq))
    }

    /// Renders one frame. The caller holds the context scope.
    pub fn render(
        &mut self,
        gpu: &mut dyn GpuDevice,
        input: &Texture,
        output: &Texture,
    ) -> Result<(), EngineError> {
        if input.size() != output.size() {
            return Err(EngineError::SizeMismatch {
                input: input.size(),
                output: output.size(),
            });
        }
        let started = Instant::now();
        let snapshot = self.controls.snapshot(self.overrides_seen);
        if let Some((version, overrides)) = snapshot.overrides {
            self.shaders.set_overrides(overrides);
            self.overrides_seen = version;
        }
        if let Some(request) = snapshot.background {
            if self.pending.replace(request).is_some() {
                debug!("Replacing pending background request");
            }
        }
        self.ensure_resources(gpu, output.width, output.height)?;

        let frame = Frame {
            effect: snapshot.effect,
            mirrored: snapshot.mirrored,
            matte_threshold: snapshot.matte_threshold,
            input,
            output,
        };
        let result = self.run_frame(gpu, &frame);
        let unbound = unbind(gpu);
        result?;
        unbound?;

        self.frames += 1;
        debug!(
            "Frame {} ({}) rendered in {:?}",
            self.frames,
            frame.effect,
            started.elapsed()
        );
        Ok(())
    }

    fn ensure_resources(
        &mut self,
        gpu: &mut dyn GpuDevice,
        width: u32,
        height: u32,
    ) -> Result<(), EngineError> {
        if self.size() == Some((width, height)) {
            return Ok(());
        }
        if let Some(old) = self.resources.take() {
            info!(
                "Frame size changed from {}x{} to {}x{}, reallocating",
                old.width, old.height, width, height
            );
            old.release(gpu);
            if self.pending.is_none() {
                if let Some(image) = &self.background {
                    self.pending = Some(BackgroundRequest {
                        image: image.clone(),
                        frames_left: 0,
                        done: None,
                    });
                }
            }
        }
        self.resources = Some(Resources::allocate(gpu, width, height)?);
        debug!("Allocated {} scratch textures at {}x{}", SCRATCH_COUNT, width, height);
        Ok(())
    }

    fn run_frame(&mut self, gpu: &mut dyn GpuDevice, frame: &Frame<'_>) -> Result<(), EngineError> {
        let Some(res) = self.resources.as_mut() else {
            unreachable!("engine resources are allocated before rendering");
        };
        gpu.bind_framebuffer(Some(res.fbo))?;
        capture_background(gpu, res, &mut self.pending, &mut self.background, frame.input)?;

        let transform = if frame.mirrored {
            QuadTransform::MirrorX
        } else {
            QuadTransform::Identity
        };
        let (s0, s1) = (res.scratch[0], res.scratch[1]);
        let input = frame.input.id;
        let output = frame.output;
        let mut passes = Passes {
            shaders: &mut self.shaders,
            width: res.width,
            height: res.height,
        };
        use TextureUnit::{Base, Blend, Curve as CurveUnit, Tex};

        match frame.effect {
            effect @ (Effect::Heat | Effect::Cross | Effect::Sepia) => {
                let curve = match effect.curve() {
                    Some(curve) => res.curve(gpu, curve)?,
                    None => unreachable!("{} has a lookup curve", effect),
                };
                let inputs = [(Tex, input), (CurveUnit, curve)];
                passes.run(gpu, kernels::LUMA_TO_CURVE, output, &inputs, transform, no_uniforms)
            }
            Effect::Emboss => {
                passes.run(gpu, kernels::CONV3X3, output, &[(Tex, input)], transform, emboss)
            }
            Effect::Sobel => {
                passes.run(gpu, kernels::SOBEL, output, &[(Tex, input)], transform, sobel)
            }
            Effect::Blur => passes.blur(gpu, input, &s0, output, transform),
            Effect::Glow => {
                let identity = QuadTransform::Identity;
                passes.run(gpu, kernels::LUMA_THRESHOLD, &s0, &[(Tex, input)], identity, no_uniforms)?;
                passes.blur(gpu, s0.id, &s1, &s0, identity)?;
                let inputs = [(Base, input), (Blend, s0.id)];
                passes.run(gpu, kernels::SUM, output, &inputs, transform, no_uniforms)
            }
            Effect::Background => match (res.saved, res.replacement) {
                (Some(saved), Some(replacement)) => {
                    let identity = QuadTransform::Identity;
                    let threshold = frame.matte_threshold;
                    passes.run(
                        gpu,
                        kernels::MATTE_DIFF,
                        &s0,
                        &[(Tex, input), (Base, saved.id)],
                        identity,
                        |u| u.set_1f("threshold", threshold),
                    )?;
                    passes.blur(gpu, s0.id, &s1, &s0, identity)?;
                    let inputs = [(Tex, input), (Base, replacement.id), (Blend, s0.id)];
                    passes.run(gpu, kernels::MATTE_MIX, output, &inputs, transform, no_uniforms)
                }
                _ => passes.run(gpu, kernels::IDENTITY, output, &[(Tex, input)], transform, no_uniforms),
            },
            warp => {
                let kernel = warp.warp_kernel().unwrap_or(kernels::IDENTITY);
                passes.run(gpu, kernel, output, &[(Tex, input)], transform, no_uniforms)
            }
        }
    }

    /// Releases every GPU object and cancels a pending background change.
    pub fn stop(&mut self, ctx: &DisplayContext) -> Result<(), EngineError> {
        let mut guard = ctx.acquire()?;
        self.stop_with(guard.gpu());
        Ok(())
    }

    pub fn stop_with(&mut self, gpu: &mut dyn GpuDevice) {
        self.shaders.release(gpu);
        if let Some(resources) = self.resources.take() {
            resources.release(gpu);
        }
        self.pending = None;
        self.background = None;
        info!("Effect engine stopped after {} frames", self.frames);
    }
}

/// What one frame renders.
struct Frame<'a> {
    effect: Effect,
    mirrored: bool,
    matte_threshold: f32,
    input: &'a Texture,
    output: &'a Texture,
}

/// Counts down a pending background change and performs it once due:
/// uploads the replacement picture and copies `input` into the reference
/// texture.
fn capture_background(
    gpu: &mut dyn GpuDevice,
    res: &mut Resources,
    pending: &mut Option<BackgroundRequest>,
    applied: &mut Option<BackgroundImage>,
    input: &Texture,
) -> Result<(), EngineError> {
    let Some(request) = pending else {
        return Ok(());
    };
    if request.frames_left > 0 {
        request.frames_left -= 1;
        return Ok(());
    }
    let Some(request) = pending.take() else {
        return Ok(());
    };

    let result = store_background(gpu, res, &request.image, input);
    match &result {
        Ok(()) => info!("Captured background at {}x{}", res.width, res.height),
        Err(e) => warn!("Background capture failed: {}", e),
    }
    if let Some(done) = request.done {
        done.resolve(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
    }
    if result.is_ok() {
        *applied = Some(request.image);
    }
    result
}

fn store_background(
    gpu: &mut dyn GpuDevice,
    res: &mut Resources,
    image: &BackgroundImage,
    input: &Texture,
) -> Result<(), EngineError> {
    let (width, height) = (res.width, res.height);
    let replacement = Resources::frame_texture(gpu, &mut res.replacement, width, height)?;
    gpu.upload_texture(replacement.id, image.resized(width, height).as_raw())?;

    let saved = Resources::frame_texture(gpu, &mut res.saved, width, height)?;
    gpu.attach_color(Some(saved.id))?;
    let status = gpu.framebuffer_status();
    assert_eq!(status, FramebufferStatus::Complete, "background framebuffer is incomplete");
    for unit in TextureUnit::ALL {
        gpu.bind_texture(unit, None)?;
    }
    gpu.bind_texture(TextureUnit::Tex, Some(input.id))?;
    ShaderProgram::use_none(gpu)?;
    gpu.draw_quad(QuadTransform::Identity)?;
    Ok(())
}

/// Leaves the device with no program, units or framebuffer bound.
fn unbind(gpu: &mut dyn GpuDevice) -> Result<(), EngineError> {
    for unit in TextureUnit::ALL {
        gpu.bind_texture(unit, None)?;
    }
    ShaderProgram::use_none(gpu)?;
    gpu.bind_framebuffer(None)?;
    gpu.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{to_rgba8, SoftwareDevice};

    fn solid(gpu: &mut dyn GpuDevice, w: u32, h: u32, rgba: [u8; 4]) -> Texture {
        let texture = gpu.create_texture(w, h, TextureFormat::Rgba8).unwrap();
        let data: Vec<u8> = (0..w * h).flat_map(|_| rgba).collect();
        gpu.upload_texture(texture.id, &data).unwrap();
        texture
    }

    fn pixels(gpu: &mut dyn GpuDevice, texture: &Texture) -> Vec<u8> {
        to_rgba8(&gpu.read_texture(texture.id).unwrap())
    }

    fn run(effect: Effect, input_color: [u8; 4]) -> Vec<u8> {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(effect);
        let mut engine = EffectEngine::new(controls);
        let input = solid(&mut gpu, 6, 4, input_color);
        let output = gpu.create_texture(6, 4, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();
        pixels(&mut gpu, &output)
    }

    #[test]
    fn test_effect_names_round_trip() {
        for effect in Effect::ALL {
            assert_eq!(effect.as_str().parse::<Effect>(), Ok(effect));
            let yaml = serde_yaml::to_string(&effect).unwrap();
            assert_eq!(yaml.trim(), effect.as_str());
        }
        assert!("vortex".parse::<Effect>().is_err());
    }

    #[test]
    fn test_flat_image_through_convolutions() {
        // Emboss taps sum to zero, so a flat image lands on the offset.
        let embossed = run(Effect::Emboss, [200, 100, 50, 255]);
        assert!(embossed.chunks(4).all(|p| p == [128, 128, 128, 255]));

        let edges = run(Effect::Sobel, [200, 100, 50, 255]);
        assert!(edges.chunks(4).all(|p| p == [0, 0, 0, 255]));

        let blurred = run(Effect::Blur, [200, 100, 50, 255]);
        assert!(blurred.chunks(4).all(|p| p == [200, 100, 50, 255]));
    }

    #[test]
    fn test_heat_maps_black_to_black() {
        let out = run(Effect::Heat, [0, 0, 0, 0]);
        assert!(out.chunks(4).all(|p| p == [0, 0, 0, 255]));
    }

    #[test]
    fn test_dark_frame_does_not_glow() {
        let out = run(Effect::Glow, [40, 40, 40, 255]);
        assert!(out.chunks(4).all(|p| p == [40, 40, 40, 255]));
    }

    #[test]
    fn test_resources_follow_frame_size() {
        let mut gpu = SoftwareDevice::new();
        let mut engine = EffectEngine::new(EffectControls::new());
        let input = solid(&mut gpu, 4, 4, [1, 2, 3, 255]);
        let output = gpu.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();
        assert_eq!(engine.size(), Some((4, 4)));
        let created = gpu.stats().textures_created;

        let big_in = solid(&mut gpu, 8, 2, [1, 2, 3, 255]);
        let big_out = gpu.create_texture(8, 2, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &big_in, &big_out).unwrap();
        assert_eq!(engine.size(), Some((8, 2)));
        assert_eq!(gpu.stats().textures_created, created + 2 + SCRATCH_COUNT as u64);

        engine.stop_with(&mut gpu);
        let stats = gpu.stats();
        assert_eq!(stats.textures_alive, 4);
        assert_eq!(stats.framebuffers_alive, 0);
        assert_eq!(stats.programs_alive, 0);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut gpu = SoftwareDevice::new();
        let mut engine = EffectEngine::new(EffectControls::new());
        let input = solid(&mut gpu, 4, 4, [0; 4]);
        let output = gpu.create_texture(4, 2, TextureFormat::Rgba8).unwrap();
        assert!(matches!(
            engine.render(&mut gpu, &input, &output),
            Err(EngineError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_shader_cache_compiles_once() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(Effect::Glow);
        let mut engine = EffectEngine::new(controls);
        let input = solid(&mut gpu, 4, 4, [0; 4]);
        let output = gpu.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
        for _ in 0..3 {
            engine.render(&mut gpu, &input, &output).unwrap();
        }
        // threshold, hconv, vconv, sum
        assert_eq!(gpu.stats().programs_compiled, 4);
        assert_eq!(engine.frames(), 3);
    }

    #[test]
    fn test_background_replaces_static_scene() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(Effect::Background);
        controls.set_capture_delay(1);
        let mut engine = EffectEngine::new(controls.clone());

        let scene = solid(&mut gpu, 4, 4, [0, 0, 255, 255]);
        let output = gpu.create_texture(4, 4, TextureFormat::Rgba8).unwrap();
        let capture = controls.set_background(BackgroundImage::solid(2, 2, [0, 255, 0, 255]));

        engine.render(&mut gpu, &scene, &output).unwrap();
        assert!(capture.try_result().is_none());
        assert_eq!(&pixels(&mut gpu, &output)[..4], &[0, 0, 255, 255]);

        engine.render(&mut gpu, &scene, &output).unwrap();
        assert_eq!(capture.wait(), Ok(()));
        assert!(engine.has_background());
        assert!(pixels(&mut gpu, &output)
            .chunks(4)
            .all(|p| p == [0, 255, 0, 255]));

        let subject = solid(&mut gpu, 4, 4, [255, 0, 0, 255]);
        engine.render(&mut gpu, &subject, &output).unwrap();
        assert!(pixels(&mut gpu, &output)
            .chunks(4)
            .all(|p| p == [255, 0, 0, 255]));
    }

    #[test]
    fn test_stop_cancels_pending_capture() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        let mut engine = EffectEngine::new(controls.clone());
        let capture = controls.set_background(BackgroundImage::solid(1, 1, [0; 4]));
        let input = solid(&mut gpu, 2, 2, [0; 4]);
        let output = gpu.create_texture(2, 2, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();
        engine.stop_with(&mut gpu);
        assert_eq!(capture.wait(), Err(CaptureError::Cancelled));
    }

    #[test]
    fn test_broken_override_passes_through() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(Effect::Heat);
        controls.set_shader_override("luma-to-curve", ShaderSource::Wgsl("fn fs_main( {".into()));
        let mut engine = EffectEngine::new(controls.clone());
        let input = solid(&mut gpu, 3, 3, [90, 60, 30, 255]);
        let output = gpu.create_texture(3, 3, TextureFormat::Rgba8).unwrap();

        engine.render(&mut gpu, &input, &output).unwrap();
        assert!(pixels(&mut gpu, &output)
            .chunks(4)
            .all(|p| p == [90, 60, 30, 255]));
        // A second frame does not try the same source again.
        engine.render(&mut gpu, &input, &output).unwrap();
        assert_eq!(gpu.stats().programs_compiled, 0);

        controls.clear_shader_override("luma-to-curve");
        engine.render(&mut gpu, &input, &output).unwrap();
        assert_eq!(gpu.stats().programs_compiled, 1);
        assert_ne!(&pixels(&mut gpu, &output)[..4], &[90, 60, 30, 255]);
    }

    #[test]
    fn test_empty_override_keeps_last_good_build() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(Effect::Heat);
        let mut engine = EffectEngine::new(controls.clone());
        let input = solid(&mut gpu, 3, 3, [90, 60, 30, 255]);
        let output = gpu.create_texture(3, 3, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();
        let heat = pixels(&mut gpu, &output);

        controls.set_shader_override("luma-to-curve", ShaderSource::Glsl("  \n".into()));
        for _ in 0..3 {
            engine.render(&mut gpu, &input, &output).unwrap();
            assert_eq!(pixels(&mut gpu, &output), heat);
        }
        assert_eq!(engine.frames(), 4);
    }

    #[test]
    fn test_override_keeps_last_good_build() {
        let mut gpu = SoftwareDevice::new();
        let controls = EffectControls::new();
        controls.set_effect(Effect::Sobel);
        let mut engine = EffectEngine::new(controls.clone());
        let input = solid(&mut gpu, 3, 3, [90, 60, 30, 255]);
        let output = gpu.create_texture(3, 3, TextureFormat::Rgba8).unwrap();
        engine.render(&mut gpu, &input, &output).unwrap();

        controls.set_shader_override("sobel", ShaderSource::Wgsl("@fragment fn fs_main( {".into()));
        engine.render(&mut gpu, &input, &output).unwrap();
        assert!(pixels(&mut gpu, &output)
            .chunks(4)
            .all(|p| p == [0, 0, 0, 255]));
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let mut gpu = SoftwareDevice::with_memory_budget(2 * 2 * 4 * 2 + 8);
        let mut engine = EffectEngine::new(EffectControls::new());
        let input = solid(&mut gpu, 2, 2, [0; 4]);
        let output = gpu.create_texture(2, 2, TextureFormat::Rgba8).unwrap();
        let err = engine.render(&mut gpu, &input, &output).unwrap_err();
        assert!(matches!(err, EngineError::Gpu(GpuError::OutOfMemory { .. })));
        assert_eq!(gpu.stats().textures_alive, 2);
        assert_eq!(engine.size(), None);
    }
}
