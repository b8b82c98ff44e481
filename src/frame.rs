//! Video frame types and their texture plane layouts.

use crate::gpu::TextureFormat;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported video formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    /// RGBA with 8 bits per channel
    Rgba,
    /// BGRA with 8 bits per channel
    Bgra,
    /// Packed AYUV 4:4:4
    Ayuv,
    /// YUV 4:2:2 packed format (Y0 U0 Y1 V0)
    Yuy2,
    /// YUV 4:2:2 packed format (U0 Y0 V0 Y1)
    Uyvy,
    /// Y plane followed by interleaved UV at half resolution
    Nv12,
    /// Y, U and V planes, chroma at half resolution
    I420,
    /// Like I420 with V stored before U
    Yv12,
}

/// One texture plane of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
}

impl PlaneLayout {
    pub fn bytes(&self) -> usize {
        self.format.image_bytes(self.width, self.height)
    }
}

impl VideoFormat {
    pub const ALL: [VideoFormat; 8] = [
        VideoFormat::Rgba,
        VideoFormat::Bgra,
        VideoFormat::Ayuv,
        VideoFormat::Yuy2,
        VideoFormat::Uyvy,
        VideoFormat::Nv12,
        VideoFormat::I420,
        VideoFormat::Yv12,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VideoFormat::Rgba => "rgba",
            VideoFormat::Bgra => "bgra",
            VideoFormat::Ayuv => "ayuv",
            VideoFormat::Yuy2 => "yuy2",
            VideoFormat::Uyvy => "uyvy",
            VideoFormat::Nv12 => "nv12",
            VideoFormat::I420 => "i420",
            VideoFormat::Yv12 => "yv12",
        }
    }

    /// Texture planes for a `width` x `height` frame, in the order they are
    /// bound (luma first, then U, then V).
    ///
    /// Packed 4:2:2 formats use one RGBA texel per pixel pair.
    pub fn planes(self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let plane = |format, width, height| PlaneLayout {
            format,
            width,
            height,
        };
        let cw = width.div_ceil(2);
        let ch = height.div_ceil(2);
        match self {
            VideoFormat::Rgba | VideoFormat::Bgra | VideoFormat::Ayuv => {
                vec![plane(TextureFormat::Rgba8, width, height)]
            }
            VideoFormat::Yuy2 | VideoFormat::Uyvy => vec![plane(TextureFormat::Rgba8, cw, height)],
            VideoFormat::Nv12 => vec![
                plane(TextureFormat::R8, width, height),
                plane(TextureFormat::Rg8, cw, ch),
            ],
            VideoFormat::I420 | VideoFormat::Yv12 => vec![
                plane(TextureFormat::R8, width, height),
                plane(TextureFormat::R8, cw, ch),
                plane(TextureFormat::R8, cw, ch),
            ],
        }
    }

    /// Size in bytes of one tightly packed frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        self.planes(width, height).iter().map(PlaneLayout::bytes).sum()
    }

    /// Splits frame bytes into per-plane slices in binding order.
    ///
    /// Returns `None` when `data` does not have the exact frame size.
    pub fn split_planes(self, width: u32, height: u32, data: &[u8]) -> Option<Vec<&[u8]>> {
        if data.len() != self.frame_size(width, height) {
            return None;
        }
        let mut planes = Vec::with_capacity(3);
        let mut rest = data;
        for layout in self.planes(width, height) {
            let (head, tail) = rest.split_at(layout.bytes());
            planes.push(head);
            rest = tail;
        }
        if self == VideoFormat::Yv12 {
            planes.swap(1, 2);
        }
        Some(planes)
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VideoFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown video format `{}`", s))
    }
}

/// A video frame containing image data.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Format of the frame data
    pub format: VideoFormat,
    /// Timestamp in microseconds (if available)
    pub timestamp_us: Option<u64>,
    /// Raw pixel data, planes back to back
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Creates a black frame with the given dimensions and format.
    pub fn new(width: u32, height: u32, format: VideoFormat) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data: vec![0; format.frame_size(width, height)],
        }
    }

    /// Creates a video frame from existing data.
    pub fn from_data(width: u32, height: u32, format: VideoFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            timestamp_us: None,
            data,
        }
    }

    pub fn from_rgba_image(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::from_data(width, height, VideoFormat::Rgba, image.into_raw())
    }

    /// Per-plane byte slices, `None` if the data size is wrong.
    pub fn planes(&self) -> Option<Vec<&[u8]>> {
        self.format.split_planes(self.width, self.height, &self.data)
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad. Texture row 0 is the top of the
    /// render target.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    /// Returns the vertex buffer layout.
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planar_frame_sizes() {
        assert_eq!(VideoFormat::Rgba.frame_size(4, 2), 32);
        assert_eq!(VideoFormat::I420.frame_size(4, 2), 8 + 2 + 2);
        assert_eq!(VideoFormat::Nv12.frame_size(5, 3), 15 + 3 * 2 * 2);
        assert_eq!(VideoFormat::Yuy2.frame_size(4, 2), 16);
    }

    #[test]
    fn test_yv12_chroma_order() {
        // 2x2 frame: 4 luma bytes, then V, then U.
        let frame = VideoFrame::from_data(2, 2, VideoFormat::Yv12, vec![1, 2, 3, 4, 9, 7]);
        let planes = frame.planes().unwrap();
        assert_eq!(planes[0], &[1, 2, 3, 4]);
        assert_eq!(planes[1], &[7], "U plane comes second");
        assert_eq!(planes[2], &[9]);
    }

    #[test]
    fn test_wrong_size_has_no_planes() {
        let frame = VideoFrame::from_data(2, 2, VideoFormat::Rgba, vec![0; 15]);
        assert!(frame.planes().is_none());
    }

    #[test]
    fn test_format_names_round_trip() {
        for format in VideoFormat::ALL {
            assert_eq!(format.as_str().parse::<VideoFormat>(), Ok(format));
        }
        assert!("rgb565".parse::<VideoFormat>().is_err());
    }
}
