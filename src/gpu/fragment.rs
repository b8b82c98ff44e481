//! CPU-side fragment evaluation.
//!
//! Native kernels mirror the WGSL fragment programs one to one so the
//! software device produces the same images as real hardware. Sampling
//! follows the hardware rules: texel centres at half-integer coordinates,
//! bilinear filtering, clamp-to-edge addressing.

use super::{ShaderUniforms, TextureUnit};

/// CPU rendition of a fragment program.
pub type FragmentKernel = fn(&Fragment<'_>) -> [f32; 4];

/// Read-only view of a texture's texels.
#[derive(Clone, Copy)]
pub(crate) struct TexelView<'a> {
    pub width: u32,
    pub height: u32,
    pub texels: &'a [[f32; 4]],
}

impl TexelView<'_> {
    fn fetch(&self, x: i32, y: i32) -> [f32; 4] {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.texels[y * self.width as usize + x]
    }
}

/// One fragment invocation: its interpolated coordinate plus the bound
/// textures and uniforms.
pub struct Fragment<'a> {
    pub uv: [f32; 2],
    pub uniforms: &'a ShaderUniforms,
    pub(crate) units: &'a [Option<TexelView<'a>>; 4],
}

impl Fragment<'_> {
    /// Dimensions of the texture on `unit`, `[1, 1]` when nothing is bound.
    pub fn size(&self, unit: TextureUnit) -> [u32; 2] {
        match &self.units[unit.index()] {
            Some(view) => [view.width, view.height],
            None => [1, 1],
        }
    }

    /// Integer texel addressed by `uv` on `unit`.
    pub fn texel_coord(&self, unit: TextureUnit, uv: [f32; 2]) -> [i32; 2] {
        let [w, h] = self.size(unit);
        [
            (uv[0] * w as f32).floor() as i32,
            (uv[1] * h as f32).floor() as i32,
        ]
    }

    /// Unfiltered fetch with coordinates clamped to the edge.
    pub fn load(&self, unit: TextureUnit, x: i32, y: i32) -> [f32; 4] {
        match &self.units[unit.index()] {
            Some(view) => view.fetch(x, y),
            None => [0.0; 4],
        }
    }

    /// Bilinear sample at normalized coordinates.
    pub fn sample(&self, unit: TextureUnit, uv: [f32; 2]) -> [f32; 4] {
        let Some(view) = &self.units[unit.index()] else {
            return [0.0; 4];
        };
        let x = uv[0] * view.width as f32 - 0.5;
        let y = uv[1] * view.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (x0, y0) = (x0 as i32, y0 as i32);

        let a = view.fetch(x0, y0);
        let b = view.fetch(x0 + 1, y0);
        let c = view.fetch(x0, y0 + 1);
        let d = view.fetch(x0 + 1, y0 + 1);
        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }
}

/// Pass-through program: copies unit `Tex`.
pub(crate) fn passthrough(f: &Fragment<'_>) -> [f32; 4] {
    f.sample(TextureUnit::Tex, f.uv)
}
