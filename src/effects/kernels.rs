//! Fragment programs of the effect catalog.
//!
//! Every pass exists twice: as WGSL for real GPUs and as a native
//! [`FragmentKernel`] with the same arithmetic for the software device.
//! Warps work on normalized coordinates `n = uv * 2 - 1`.

use crate::gpu::{Fragment, FragmentKernel, TextureUnit};
use crate::shader::{with_prelude, PASSTHROUGH_FRAGMENT};

/// Rotation, in radians, twirl adds at the centre.
pub const TWIRL_STRENGTH: f32 = 4.2;

/// Rec. 709 luma weights.
pub const LUMA_WEIGHTS: [f32; 3] = [0.2125, 0.7154, 0.0721];

/// 9-tap Gaussian (sigma 2) and the sum of its taps.
pub const GAUSSIAN_9: [f32; 9] = [
    0.026995, 0.064759, 0.120985, 0.176033, 0.199471, 0.176033, 0.120985, 0.064759, 0.026995,
];
pub const GAUSSIAN_NORM: f32 = 0.977016;

pub const EMBOSS_3X3: [f32; 9] = [2.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0];
pub const EMBOSS_OFFSET: f32 = 0.5;

pub const SOBEL_H: [f32; 9] = [1.0, 0.0, -1.0, 2.0, 0.0, -2.0, 1.0, 0.0, -1.0];
pub const SOBEL_V: [f32; 9] = [1.0, 2.0, 1.0, 0.0, 0.0, 0.0, -1.0, -2.0, -1.0];

/// Luma band that glow lets through.
pub const GLOW_LOW: f32 = 0.30;
pub const GLOW_HIGH: f32 = 0.31;

/// Helpers shared by every effect program.
const COMMON: &str = r#"
const LUMA: vec3<f32> = vec3<f32>(0.2125, 0.7154, 0.0721);

fn to_normal(uv: vec2<f32>) -> vec2<f32> {
    return uv * 2.0 - 1.0;
}

fn from_normal(n: vec2<f32>) -> vec2<f32> {
    return (n + 1.0) * 0.5;
}

fn texel_of(uv: vec2<f32>) -> vec2<i32> {
    return vec2<i32>(floor(uv * vec2<f32>(textureDimensions(t_tex))));
}

fn load_clamped(p: vec2<i32>) -> vec4<f32> {
    let last = vec2<i32>(textureDimensions(t_tex)) - 1;
    return textureLoad(t_tex, clamp(p, vec2<i32>(0), last), 0);
}
"#;

/// One pass program.
#[derive(Clone, Copy)]
pub struct Kernel {
    /// Shader cache key.
    pub key: &'static str,
    body: &'static str,
    pub native: FragmentKernel,
}

impl Kernel {
    /// Complete WGSL fragment source.
    pub fn source(&self) -> String {
        wrap_body(self.body)
    }
}

/// Completes a WGSL fragment body with the shared declarations and helpers.
pub fn wrap_body(body: &str) -> String {
    let mut source = with_prelude(COMMON);
    source.push_str(body);
    source
}

macro_rules! kernel {
    ($name:ident, $key:literal, $body:expr, $native:ident) => {
        pub const $name: Kernel = Kernel {
            key: $key,
            body: $body,
            native: $native,
        };
    };
}

kernel!(IDENTITY, "identity", PASSTHROUGH_FRAGMENT, identity);
kernel!(MIRROR, "mirror", MIRROR_WGSL, mirror);
kernel!(SQUEEZE, "squeeze", SQUEEZE_WGSL, squeeze);
kernel!(STRETCH, "stretch", STRETCH_WGSL, stretch);
kernel!(TUNNEL, "tunnel", TUNNEL_WGSL, tunnel);
kernel!(FISHEYE, "fisheye", FISHEYE_WGSL, fisheye);
kernel!(TWIRL, "twirl", TWIRL_WGSL, twirl);
kernel!(BULGE, "bulge", BULGE_WGSL, bulge);
kernel!(SQUARE, "square", SQUARE_WGSL, square);
kernel!(LUMA_TO_CURVE, "luma-to-curve", LUMA_TO_CURVE_WGSL, luma_to_curve);
kernel!(CONV3X3, "conv3x3", CONV3X3_WGSL, conv3x3);
kernel!(SOBEL, "sobel", SOBEL_WGSL, sobel);
kernel!(HCONV9, "hconv9", HCONV9_WGSL, hconv9);
kernel!(VCONV9, "vconv9", VCONV9_WGSL, vconv9);
kernel!(LUMA_THRESHOLD, "luma-threshold", LUMA_THRESHOLD_WGSL, luma_threshold);
kernel!(SUM, "sum", SUM_WGSL, sum);
kernel!(MATTE_DIFF, "matte-diff", MATTE_DIFF_WGSL, matte_diff);
kernel!(MATTE_MIX, "matte-mix", MATTE_MIX_WGSL, matte_mix);

pub const ALL: [Kernel; 18] = [
    IDENTITY,
    MIRROR,
    SQUEEZE,
    STRETCH,
    TUNNEL,
    FISHEYE,
    TWIRL,
    BULGE,
    SQUARE,
    LUMA_TO_CURVE,
    CONV3X3,
    SOBEL,
    HCONV9,
    VCONV9,
    LUMA_THRESHOLD,
    SUM,
    MATTE_DIFF,
    MATTE_MIX,
];

pub fn by_key(key: &str) -> Option<Kernel> {
    ALL.into_iter().find(|k| k.key == key)
}

const MIRROR_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    n.x = abs(n.x);
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const SQUEEZE_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    let r = max(pow(length(n), 0.4) * 1.3, 1e-6);
    n = n / r;
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const STRETCH_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    let r = length(n);
    n *= 2.0 - smoothstep(0.0, 0.7, r);
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const TUNNEL_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let aspect = params.size.y / params.size.x;
    var n = to_normal(uv);
    n.y *= aspect;
    let r = clamp(length(n), 0.0, 0.5);
    let phi = atan2(n.y, n.x);
    n = vec2<f32>(r * cos(phi), r * sin(phi));
    n.y /= aspect;
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const FISHEYE_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    let r = length(n);
    n *= r / sqrt(2.0);
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const TWIRL_WGSL: &str = r#"
const TWIRL_STRENGTH: f32 = 4.2;

@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let n = to_normal(uv);
    let r = length(n);
    let phi = atan2(n.y, n.x) + (1.0 - smoothstep(-0.6, 0.6, r)) * TWIRL_STRENGTH;
    let m = vec2<f32>(r * cos(phi), r * sin(phi));
    return textureSample(t_tex, s_sampler, from_normal(m));
}
"#;

const BULGE_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    let r = length(n);
    n *= smoothstep(-0.1, 0.5, r);
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const SQUARE_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    var n = to_normal(uv);
    n *= 1.0 + smoothstep(vec2<f32>(0.25), vec2<f32>(0.5), abs(n));
    n /= 2.0;
    return textureSample(t_tex, s_sampler, from_normal(n));
}
"#;

const LUMA_TO_CURVE_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let color = textureSample(t_tex, s_sampler, uv);
    let luma = dot(color.rgb, LUMA);
    let index = clamp(i32(luma * 256.0), 0, 255);
    let mapped = textureLoad(t_curve, vec2<i32>(index, 0), 0);
    return vec4<f32>(mapped.rgb, 1.0);
}
"#;

const CONV3X3_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let p = texel_of(uv);
    var sum = vec3<f32>(0.0);
    for (var j = 0; j < 3; j++) {
        for (var i = 0; i < 3; i++) {
            let k = u32(j * 3 + i);
            let c = load_clamped(p + vec2<i32>(i - 1, j - 1));
            sum += c.rgb * params.kernel[k / 4u][k % 4u];
        }
    }
    let center = load_clamped(p);
    return vec4<f32>(sum / params.norm_const + params.norm_offset, center.a);
}
"#;

const SOBEL_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let p = texel_of(uv);
    var gx = 0.0;
    var gy = 0.0;
    for (var j = 0; j < 3; j++) {
        for (var i = 0; i < 3; i++) {
            let k = u32(j * 3 + i);
            let luma = dot(load_clamped(p + vec2<i32>(i - 1, j - 1)).rgb, LUMA);
            gx += luma * params.hkern[k / 4u][k % 4u];
            gy += luma * params.vkern[k / 4u][k % 4u];
        }
    }
    let g = sqrt(gx * gx + gy * gy);
    return vec4<f32>(g, g, g, 1.0);
}
"#;

const HCONV9_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let p = texel_of(uv);
    var sum = vec4<f32>(0.0);
    for (var i = 0; i < 9; i++) {
        let k = u32(i);
        sum += load_clamped(p + vec2<i32>(i - 4, 0)) * params.hkern[k / 4u][k % 4u];
    }
    return sum / params.norm_const + params.norm_offset;
}
"#;

const VCONV9_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let p = texel_of(uv);
    var sum = vec4<f32>(0.0);
    for (var i = 0; i < 9; i++) {
        let k = u32(i);
        sum += load_clamped(p + vec2<i32>(0, i - 4)) * params.vkern[k / 4u][k % 4u];
    }
    return sum / params.norm_const + params.norm_offset;
}
"#;

const LUMA_THRESHOLD_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let color = textureSample(t_tex, s_sampler, uv);
    let luma = dot(color.rgb, LUMA);
    return color * smoothstep(0.30, 0.31, luma);
}
"#;

const SUM_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let base = textureSample(t_base, s_sampler, uv);
    let blend = textureSample(t_blend, s_sampler, uv);
    return vec4<f32>(clamp(base.rgb + blend.rgb, vec3<f32>(0.0), vec3<f32>(1.0)), base.a);
}
"#;

const MATTE_DIFF_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let current = textureSample(t_tex, s_sampler, uv);
    let saved = textureSample(t_base, s_sampler, uv);
    let d = distance(current.rgb, saved.rgb);
    let m = smoothstep(params.threshold, params.threshold + 0.1, d);
    return vec4<f32>(m, m, m, 1.0);
}
"#;

const MATTE_MIX_WGSL: &str = r#"
@fragment
fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    let frame = textureSample(t_tex, s_sampler, uv);
    let background = textureSample(t_base, s_sampler, uv);
    let mask = textureSample(t_blend, s_sampler, uv);
    return vec4<f32>(mix(background.rgb, frame.rgb, mask.r), 1.0);
}
"#;

pub(crate) fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub(crate) fn luma(c: [f32; 4]) -> f32 {
    c[0] * LUMA_WEIGHTS[0] + c[1] * LUMA_WEIGHTS[1] + c[2] * LUMA_WEIGHTS[2]
}

fn to_normal(uv: [f32; 2]) -> [f32; 2] {
    [uv[0] * 2.0 - 1.0, uv[1] * 2.0 - 1.0]
}

fn from_normal(n: [f32; 2]) -> [f32; 2] {
    [(n[0] + 1.0) * 0.5, (n[1] + 1.0) * 0.5]
}

fn length(n: [f32; 2]) -> f32 {
    n[0].hypot(n[1])
}

fn scale(n: [f32; 2], s: f32) -> [f32; 2] {
    [n[0] * s, n[1] * s]
}

fn warp(f: &Fragment<'_>, remap: impl Fn([f32; 2]) -> [f32; 2]) -> [f32; 4] {
    let n = remap(to_normal(f.uv));
    f.sample(TextureUnit::Tex, from_normal(n))
}

fn identity(f: &Fragment<'_>) -> [f32; 4] {
    f.sample(TextureUnit::Tex, f.uv)
}

fn mirror(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| [n[0].abs(), n[1]])
}

fn squeeze(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| {
        let r = (length(n).powf(0.4) * 1.3).max(1e-6);
        [n[0] / r, n[1] / r]
    })
}

fn stretch(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| scale(n, 2.0 - smoothstep(0.0, 0.7, length(n))))
}

fn tunnel(f: &Fragment<'_>) -> [f32; 4] {
    let [width, height] = f.uniforms.size;
    let aspect = height / width;
    warp(f, |n| {
        let n = [n[0], n[1] * aspect];
        let r = length(n).clamp(0.0, 0.5);
        let phi = n[1].atan2(n[0]);
        [r * phi.cos(), r * phi.sin() / aspect]
    })
}

fn fisheye(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| scale(n, length(n) / std::f32::consts::SQRT_2))
}

fn twirl(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| {
        let r = length(n);
        let phi = n[1].atan2(n[0]) + (1.0 - smoothstep(-0.6, 0.6, r)) * TWIRL_STRENGTH;
        [r * phi.cos(), r * phi.sin()]
    })
}

fn bulge(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| scale(n, smoothstep(-0.1, 0.5, length(n))))
}

fn square(f: &Fragment<'_>) -> [f32; 4] {
    warp(f, |n| {
        n.map(|c| c * (1.0 + smoothstep(0.25, 0.5, c.abs())) / 2.0)
    })
}

fn luma_to_curve(f: &Fragment<'_>) -> [f32; 4] {
    let color = f.sample(TextureUnit::Tex, f.uv);
    let index = ((luma(color) * 256.0) as i32).clamp(0, 255);
    let mapped = f.load(TextureUnit::Curve, index, 0);
    [mapped[0], mapped[1], mapped[2], 1.0]
}

fn conv3x3(f: &Fragment<'_>) -> [f32; 4] {
    let [px, py] = f.texel_coord(TextureUnit::Tex, f.uv);
    let mut sum = [0.0f32; 3];
    for j in 0..3 {
        for i in 0..3 {
            let c = f.load(TextureUnit::Tex, px + i - 1, py + j - 1);
            let k = f.uniforms.kernel_tap((j * 3 + i) as usize);
            for ch in 0..3 {
                sum[ch] += c[ch] * k;
            }
        }
    }
    let center = f.load(TextureUnit::Tex, px, py);
    let u = f.uniforms;
    let out = sum.map(|s| s / u.norm_const + u.norm_offset);
    [out[0], out[1], out[2], center[3]]
}

fn sobel(f: &Fragment<'_>) -> [f32; 4] {
    let [px, py] = f.texel_coord(TextureUnit::Tex, f.uv);
    let (mut gx, mut gy) = (0.0f32, 0.0f32);
    for j in 0..3 {
        for i in 0..3 {
            let l = luma(f.load(TextureUnit::Tex, px + i - 1, py + j - 1));
            let k = (j * 3 + i) as usize;
            gx += l * f.uniforms.hkern_tap(k);
            gy += l * f.uniforms.vkern_tap(k);
        }
    }
    let g = (gx * gx + gy * gy).sqrt();
    [g, g, g, 1.0]
}

fn conv9(f: &Fragment<'_>, step: [i32; 2], tap: impl Fn(usize) -> f32) -> [f32; 4] {
    let [px, py] = f.texel_coord(TextureUnit::Tex, f.uv);
    let mut sum = [0.0f32; 4];
    for i in 0..9i32 {
        let c = f.load(TextureUnit::Tex, px + (i - 4) * step[0], py + (i - 4) * step[1]);
        let k = tap(i as usize);
        for ch in 0..4 {
            sum[ch] += c[ch] * k;
        }
    }
    sum.map(|s| s / f.uniforms.norm_const + f.uniforms.norm_offset)
}

fn hconv9(f: &Fragment<'_>) -> [f32; 4] {
    conv9(f, [1, 0], |i| f.uniforms.hkern_tap(i))
}

fn vconv9(f: &Fragment<'_>) -> [f32; 4] {
    conv9(f, [0, 1], |i| f.uniforms.vkern_tap(i))
}

fn luma_threshold(f: &Fragment<'_>) -> [f32; 4] {
    let color = f.sample(TextureUnit::Tex, f.uv);
    let s = smoothstep(GLOW_LOW, GLOW_HIGH, luma(color));
    color.map(|c| c * s)
}

fn sum(f: &Fragment<'_>) -> [f32; 4] {
    let base = f.sample(TextureUnit::Base, f.uv);
    let blend = f.sample(TextureUnit::Blend, f.uv);
    [
        (base[0] + blend[0]).clamp(0.0, 1.0),
        (base[1] + blend[1]).clamp(0.0, 1.0),
        (base[2] + blend[2]).clamp(0.0, 1.0),
        base[3],
    ]
}

fn matte_diff(f: &Fragment<'_>) -> [f32; 4] {
    let current = f.sample(TextureUnit::Tex, f.uv);
    let saved = f.sample(TextureUnit::Base, f.uv);
    let d = ((current[0] - saved[0]).powi(2)
        + (current[1] - saved[1]).powi(2)
        + (current[2] - saved[2]).powi(2))
    .sqrt();
    let t = f.uniforms.threshold;
    let m = smoothstep(t, t + 0.1, d);
    [m, m, m, 1.0]
}

fn matte_mix(f: &Fragment<'_>) -> [f32; 4] {
    let frame = f.sample(TextureUnit::Tex, f.uv);
    let background = f.sample(TextureUnit::Base, f.uv);
    let mask = f.sample(TextureUnit::Blend, f.uv)[0];
    let mix = |a: f32, b: f32| a + (b - a) * mask;
    [
        mix(background[0], frame[0]),
        mix(background[1], frame[1]),
        mix(background[2], frame[2]),
        1.0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::fragment::TexelView;
    use crate::gpu::{ProgramDesc, ShaderUniforms};
    use crate::shader::check_program;

    #[test]
    fn test_every_kernel_links() {
        for kernel in ALL {
            let source = kernel.source();
            let result = check_program(&ProgramDesc {
                label: kernel.key,
                vertex: None,
                fragment: &source,
                kernel: Some(kernel.native),
            });
            assert!(result.is_ok(), "{}: {:?}", kernel.key, result.err());
        }
    }

    #[test]
    fn test_keys_are_unique() {
        for (i, a) in ALL.iter().enumerate() {
            assert!(ALL[i + 1..].iter().all(|b| b.key != a.key));
            assert_eq!(by_key(a.key).map(|k| k.key), Some(a.key));
        }
    }

    #[test]
    fn test_gaussian_norm_is_tap_sum() {
        let total: f32 = GAUSSIAN_9.iter().sum();
        assert!((total - GAUSSIAN_NORM).abs() < 1e-5);
    }

    #[test]
    fn test_conv9_adds_norm_offset() {
        let texels = vec![[0.5, 0.25, 0.0, 1.0]; 9 * 3];
        let view = TexelView {
            width: 9,
            height: 3,
            texels: &texels,
        };
        let units = [Some(view), None, None, None];
        let mut uniforms = ShaderUniforms::default();
        uniforms.set_1fv("hkern", &GAUSSIAN_9).unwrap();
        uniforms.set_1fv("vkern", &GAUSSIAN_9).unwrap();
        uniforms.set_1f("norm_const", GAUSSIAN_NORM).unwrap();
        uniforms.set_1f("norm_offset", 0.125).unwrap();
        let fragment = Fragment {
            uv: [0.5, 0.5],
            uniforms: &uniforms,
            units: &units,
        };
        for out in [hconv9(&fragment), vconv9(&fragment)] {
            let expected = [0.625, 0.375, 0.125, 1.125];
            for (got, want) in out.iter().zip(expected) {
                assert!((got - want).abs() < 1e-5, "{:?}", out);
            }
        }
    }

    #[test]
    fn test_smoothstep_edges() {
        assert_eq!(smoothstep(0.0, 1.0, -1.0), 0.0);
        assert_eq!(smoothstep(0.0, 1.0, 2.0), 1.0);
        assert!((smoothstep(0.0, 1.0, 0.5) - 0.5).abs() < 1e-6);
    }
}
