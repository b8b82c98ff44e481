use super::{ShaderError, ShaderSource, Stage};
use crate::gpu::{FragmentKernel, GpuDevice, ProgramDesc, ProgramId};
use tracing::{debug, info};

/// A compiled and linked GPU program.
///
/// The fragment source is required, the vertex source optional (the quad
/// vertex stage is used otherwise). Compiling unchanged sources again is a
/// no-op. When changed sources fail to compile, the previously linked
/// handle stays alive and can still be activated through
/// [`ShaderProgram::use_last_good`].
pub struct ShaderProgram {
    label: String,
    vertex: Option<ShaderSource>,
    fragment: Option<ShaderSource>,
    kernel: Option<FragmentKernel>,
    handle: Option<ProgramId>,
    built_from: Option<(Option<ShaderSource>, ShaderSource)>,
    compiled: bool,
}

impl ShaderProgram {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            vertex: None,
            fragment: None,
            kernel: None,
            handle: None,
            built_from: None,
            compiled: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn handle(&self) -> Option<ProgramId> {
        self.handle
    }

    pub fn fragment_source(&self) -> Option<&ShaderSource> {
        self.fragment.as_ref()
    }

    pub fn set_vertex_source(
        &mut self,
        source: impl Into<ShaderSource>,
    ) -> Result<(), ShaderError> {
        let source = non_empty(source.into(), Stage::Vertex)?;
        self.vertex = Some(source);
        self.refresh_compiled();
        Ok(())
    }

    pub fn set_fragment_source(
        &mut self,
        source: impl Into<ShaderSource>,
    ) -> Result<(), ShaderError> {
        let source = non_empty(source.into(), Stage::Fragment)?;
        self.fragment = Some(source);
        self.refresh_compiled();
        Ok(())
    }

    /// CPU rendition of the fragment stage for devices without shader
    /// support.
    pub fn set_kernel(&mut self, kernel: Option<FragmentKernel>) {
        self.kernel = kernel;
        self.compiled = false;
    }

    fn refresh_compiled(&mut self) {
        self.compiled = match (&self.built_from, &self.fragment) {
            (Some((vertex, fragment)), Some(current)) => {
                *vertex == self.vertex && fragment == current
            }
            _ => false,
        };
    }

    pub fn compile_and_link(&mut self, gpu: &mut dyn GpuDevice) -> Result<(), ShaderError> {
        if self.compiled {
            return Ok(());
        }
        let fragment = self
            .fragment
            .as_ref()
            .ok_or_else(|| ShaderError::MissingSource(self.label.clone()))?;
        let fragment_wgsl = fragment.to_wgsl(&self.label, Stage::Fragment)?;
        let vertex_wgsl = match &self.vertex {
            Some(v) => Some(v.to_wgsl(&self.label, Stage::Vertex)?),
            None => None,
        };

        let id = gpu.compile_program(&ProgramDesc {
            label: &self.label,
            vertex: vertex_wgsl.as_deref(),
            fragment: &fragment_wgsl,
            kernel: self.kernel,
        })?;

        if let Some(old) = self.handle.replace(id) {
            gpu.delete_program(old)?;
        }
        self.built_from = Some((self.vertex.clone(), fragment.clone()));
        self.compiled = true;
        info!("Compiled shader `{}`", self.label);
        Ok(())
    }

    /// Activates the program. Fails if the current sources are not linked.
    pub fn use_program(&self, gpu: &mut dyn GpuDevice) -> Result<(), ShaderError> {
        match (self.compiled, self.handle) {
            (true, Some(id)) => Ok(gpu.use_program(Some(id))?),
            _ => Err(ShaderError::NotCompiled(self.label.clone())),
        }
    }

    /// Activates the most recently linked build, even if the sources have
    /// changed since.
    pub fn use_last_good(&self, gpu: &mut dyn GpuDevice) -> Result<(), ShaderError> {
        let id = self
            .handle
            .ok_or_else(|| ShaderError::NotCompiled(self.label.clone()))?;
        Ok(gpu.use_program(Some(id))?)
    }

    /// Restores the pass-through state.
    pub fn use_none(gpu: &mut dyn GpuDevice) -> Result<(), ShaderError> {
        Ok(gpu.use_program(None)?)
    }

    pub fn is_active(&self, gpu: &dyn GpuDevice) -> bool {
        self.handle.is_some() && gpu.active_program() == self.handle
    }

    pub fn set_uniform_1f(
        &self,
        gpu: &mut dyn GpuDevice,
        name: &str,
        value: f32,
    ) -> Result<(), ShaderError> {
        if !self.is_active(gpu) {
            return Err(ShaderError::Inactive(self.label.clone()));
        }
        Ok(gpu.set_uniform_1f(name, value)?)
    }

    pub fn set_uniform_1fv(
        &self,
        gpu: &mut dyn GpuDevice,
        name: &str,
        values: &[f32],
    ) -> Result<(), ShaderError> {
        if !self.is_active(gpu) {
            return Err(ShaderError::Inactive(self.label.clone()));
        }
        Ok(gpu.set_uniform_1fv(name, values)?)
    }

    /// Deletes the GPU program. Sources are kept.
    pub fn release(&mut self, gpu: &mut dyn GpuDevice) {
        if let Some(id) = self.handle.take() {
            if let Err(e) = gpu.delete_program(id) {
                debug!("Deleting program `{}` failed: {}", self.label, e);
            }
        }
        self.built_from = None;
        self.compiled = false;
    }
}

fn non_empty(source: ShaderSource, stage: Stage) -> Result<ShaderSource, ShaderError> {
    if source.text().trim().is_empty() {
        return Err(ShaderError::InvalidArgument { stage });
    }
    Ok(source)
}
