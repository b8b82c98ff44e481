//! Shader programs and their compile/link lifecycle.
//!
//! Sources are WGSL. GLSL is accepted and translated through naga, the same
//! way user shaders are loaded elsewhere in the crate. Compilation means
//! naga parsing and validation; linking checks that both stages fit the
//! fixed binding layout every program shares.

mod program;

pub use program::ShaderProgram;

use crate::gpu::{GpuError, ProgramDesc, ShaderUniforms};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Declarations shared by every stage: the uniform block and the four
/// texture units plus one sampler.
pub const PRELUDE: &str = r#"
struct Params {
    size: vec2<f32>,
    norm_const: f32,
    norm_offset: f32,
    flip_x: f32,
    threshold: f32,
    pad: vec2<f32>,
    kernel: array<vec4<f32>, 3>,
    hkern: array<vec4<f32>, 3>,
    vkern: array<vec4<f32>, 3>,
}

@group(0) @binding(0) var t_tex: texture_2d<f32>;
@group(0) @binding(1) var t_base: texture_2d<f32>;
@group(0) @binding(2) var t_blend: texture_2d<f32>;
@group(0) @binding(3) var t_curve: texture_2d<f32>;
@group(0) @binding(4) var s_sampler: sampler;
@group(0) @binding(5) var<uniform> params: Params;
"#;

/// Full-screen quad vertex stage. `flip_x` mirrors the quad.
pub const DEFAULT_VERTEX: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position.x * params.flip_x, in.position.y, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Copies unit `Tex`.
pub const PASSTHROUGH_FRAGMENT: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_tex, s_sampler, uv);
}
"#;

/// Binding slots of the shared layout.
pub(crate) const TEXTURE_BINDINGS: u32 = 4;
pub(crate) const SAMPLER_BINDING: u32 = 4;
pub(crate) const UNIFORM_BINDING: u32 = 5;

/// Prepends [`PRELUDE`] to a stage body.
pub fn with_prelude(body: &str) -> String {
    let mut source = String::with_capacity(PRELUDE.len() + body.len());
    source.push_str(PRELUDE);
    source.push_str(body);
    source
}

/// Pipeline stage of a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Vertex,
    Fragment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Vertex => f.write_str("vertex"),
            Stage::Fragment => f.write_str("fragment"),
        }
    }
}

impl From<Stage> for naga::ShaderStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Vertex => naga::ShaderStage::Vertex,
            Stage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// Shader source tagged with its language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShaderSource {
    /// GLSL 450 source, translated to WGSL before compilation
    Glsl(String),
    /// WGSL source
    Wgsl(String),
}

impl ShaderSource {
    pub fn text(&self) -> &str {
        match self {
            ShaderSource::Glsl(s) | ShaderSource::Wgsl(s) => s,
        }
    }

    /// Picks the language from a file extension (`.wgsl` or GLSL otherwise).
    pub fn from_path(path: &std::path::Path, text: String) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("wgsl") => ShaderSource::Wgsl(text),
            _ => ShaderSource::Glsl(text),
        }
    }

    /// WGSL text of this source.
    pub fn to_wgsl(&self, label: &str, stage: Stage) -> Result<Cow<'_, str>, ShaderError> {
        match self {
            ShaderSource::Wgsl(s) => Ok(Cow::Borrowed(s)),
            ShaderSource::Glsl(s) => glsl_to_wgsl(label, stage, s).map(Cow::Owned),
        }
    }
}

impl From<&str> for ShaderSource {
    fn from(s: &str) -> Self {
        ShaderSource::Wgsl(s.to_string())
    }
}

impl From<String> for ShaderSource {
    fn from(s: String) -> Self {
        ShaderSource::Wgsl(s)
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("{stage} shader source is empty")]
    InvalidArgument { stage: Stage },
    #[error("program `{0}` has no fragment source")]
    MissingSource(String),
    #[error("failed to compile {stage} shader of `{label}`:\n{log}")]
    Compile {
        label: String,
        stage: Stage,
        log: String,
    },
    #[error("failed to link `{label}`: {log}")]
    Link { label: String, log: String },
    #[error("program `{0}` is not compiled")]
    NotCompiled(String),
    #[error("program `{0}` is not the active program")]
    Inactive(String),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Converts a GLSL shader stage to WGSL.
pub fn glsl_to_wgsl(label: &str, stage: Stage, glsl: &str) -> Result<String, ShaderError> {
    let compile_error = |log: String| ShaderError::Compile {
        label: label.to_string(),
        stage,
        log,
    };
    let mut frontend = Frontend::default();
    let options = Options::from(naga::ShaderStage::from(stage));
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| compile_error(format!("GLSL parse error: {:?}", e)))?;
    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| compile_error(e.emit_to_string(glsl)))?;
    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| compile_error(format!("WGSL generation error: {:?}", e)))
}

/// Entry points selected by [`check_program`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterface {
    pub vertex_entry: String,
    pub fragment_entry: String,
}

/// Compiles both stages of `desc` with naga and checks that they link
/// against the shared layout.
pub fn check_program(desc: &ProgramDesc<'_>) -> Result<ProgramInterface, ShaderError> {
    let vertex_source = desc.vertex.unwrap_or(DEFAULT_VERTEX_WITH_PRELUDE.as_str());
    let vertex = compile_stage(desc.label, Stage::Vertex, vertex_source)?;
    let fragment = compile_stage(desc.label, Stage::Fragment, desc.fragment)?;

    let link_error = |log: String| ShaderError::Link {
        label: desc.label.to_string(),
        log,
    };
    let vertex_entry = entry_point(&vertex, naga::ShaderStage::Vertex)
        .ok_or_else(|| link_error("no vertex entry point".to_string()))?;
    let fragment_entry = entry_point(&fragment, naga::ShaderStage::Fragment)
        .ok_or_else(|| link_error("no fragment entry point".to_string()))?;

    check_bindings(&vertex).map_err(link_error)?;
    check_bindings(&fragment).map_err(link_error)?;
    check_fragment_inputs(&fragment, &fragment_entry.name).map_err(link_error)?;

    Ok(ProgramInterface {
        vertex_entry: vertex_entry.name.clone(),
        fragment_entry: fragment_entry.name.clone(),
    })
}

/// The default vertex stage with its prelude, built once.
pub(crate) static DEFAULT_VERTEX_WITH_PRELUDE: std::sync::LazyLock<String> =
    std::sync::LazyLock::new(|| with_prelude(DEFAULT_VERTEX));

fn compile_stage(label: &str, stage: Stage, source: &str) -> Result<naga::Module, ShaderError> {
    let compile_error = |log: String| ShaderError::Compile {
        label: label.to_string(),
        stage,
        log,
    };
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| compile_error(e.emit_to_string(source)))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| compile_error(e.emit_to_string(source)))?;
    Ok(module)
}

fn entry_point(module: &naga::Module, stage: naga::ShaderStage) -> Option<&naga::EntryPoint> {
    module.entry_points.iter().find(|ep| ep.stage == stage)
}

fn check_bindings(module: &naga::Module) -> Result<(), String> {
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        let name = var.name.as_deref().unwrap_or("<unnamed>");
        if binding.group != 0 {
            return Err(format!("`{}` uses bind group {}", name, binding.group));
        }
        let inner = &module.types[var.ty].inner;
        let fits = match binding.binding {
            b if b < TEXTURE_BINDINGS => matches!(inner, naga::TypeInner::Image { .. }),
            SAMPLER_BINDING => matches!(inner, naga::TypeInner::Sampler { comparison: false }),
            UNIFORM_BINDING => {
                var.space == naga::AddressSpace::Uniform
                    && inner.size(module.to_ctx()) as usize <= ShaderUniforms::BYTE_SIZE
            }
            _ => false,
        };
        if !fits {
            return Err(format!(
                "`{}` at binding {} does not match the program layout",
                name, binding.binding
            ));
        }
    }
    Ok(())
}

fn check_fragment_inputs(module: &naga::Module, entry: &str) -> Result<(), String> {
    let Some(ep) = module.entry_points.iter().find(|ep| ep.name == entry) else {
        return Ok(());
    };
    let mut locations = Vec::new();
    for arg in &ep.function.arguments {
        match &arg.binding {
            Some(naga::Binding::Location { location, .. }) => locations.push(*location),
            Some(naga::Binding::BuiltIn(_)) => {}
            None => {
                if let naga::TypeInner::Struct { members, .. } = &module.types[arg.ty].inner {
                    for member in members {
                        if let Some(naga::Binding::Location { location, .. }) = &member.binding {
                            locations.push(*location);
                        }
                    }
                }
            }
        }
    }
    match locations.iter().find(|l| **l != 0) {
        Some(l) => Err(format!(
            "fragment input location {} is not produced by the vertex stage",
            l
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(fragment: &str) -> ProgramDesc<'_> {
        ProgramDesc {
            label: "test",
            vertex: None,
            fragment,
            kernel: None,
        }
    }

    #[test]
    fn test_passthrough_links() {
        let source = with_prelude(PASSTHROUGH_FRAGMENT);
        let iface = check_program(&desc(&source)).unwrap();
        assert_eq!(iface.vertex_entry, "vs_main");
        assert_eq!(iface.fragment_entry, "fs_main");
    }

    #[test]
    fn test_syntax_error_is_compile_error() {
        let source = with_prelude("@fragment fn fs_main( -> {");
        let err = check_program(&desc(&source)).unwrap_err();
        assert!(matches!(
            err,
            ShaderError::Compile {
                stage: Stage::Fragment,
                ..
            }
        ));
    }

    #[test]
    fn test_foreign_binding_fails_link() {
        let source = r#"
@group(1) @binding(0) var t_other: texture_2d<f32>;
@group(0) @binding(4) var s: sampler;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_other, s, uv);
}
"#;
        assert!(matches!(
            check_program(&desc(source)),
            Err(ShaderError::Link { .. })
        ));
    }

    #[test]
    fn test_missing_fragment_entry_fails_link() {
        let source = with_prelude("fn helper() -> f32 { return 1.0; }");
        assert!(matches!(
            check_program(&desc(&source)),
            Err(ShaderError::Link { .. })
        ));
    }

    #[test]
    fn test_glsl_translation() {
        let glsl = r#"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 o_color;
layout(set = 0, binding = 0) uniform texture2D t_tex;
layout(set = 0, binding = 4) uniform sampler s_sampler;

void main() {
    o_color = texture(sampler2D(t_tex, s_sampler), v_uv).bgra;
}
"#;
        let source = ShaderSource::Glsl(glsl.to_string());
        let wgsl = source
            .to_wgsl("swap", Stage::Fragment)
            .unwrap();
        let iface = check_program(&desc(&wgsl)).unwrap();
        assert_eq!(iface.fragment_entry, "main");
    }
}
