//! wgpu implementation of [`GpuDevice`].
//!
//! Every program shares one bind group layout (four textures, a sampler and
//! the [`ShaderUniforms`] block). Render pipelines are built per target
//! format on first use. Draws are submitted one by one so uniform values
//! never alias between passes.

use super::{
    check_size, check_upload, decode_texel, DeviceStats, FramebufferId, FramebufferStatus,
    GpuDevice, GpuError, GpuResult, ProgramDesc, ProgramId, QuadTransform, ShaderUniforms,
    Texture, TextureFormat, TextureId, TextureUnit,
};
use crate::frame::QuadVertex;
use crate::shader::{self, ShaderError, DEFAULT_VERTEX_WITH_PRELUDE, PASSTHROUGH_FRAGMENT};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{debug, info, trace};
use wgpu::util::DeviceExt;

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: Texture,
}

struct GpuProgram {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    vertex_entry: String,
    fragment_entry: String,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    uniforms: ShaderUniforms,
}

struct SurfaceTarget {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

/// GPU device backed by wgpu.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    blank_view: wgpu::TextureView,
    passthrough: GpuProgram,
    textures: HashMap<TextureId, GpuTexture>,
    framebuffers: HashMap<FramebufferId, Option<TextureId>>,
    programs: HashMap<ProgramId, GpuProgram>,
    bound_framebuffer: Option<FramebufferId>,
    active_program: Option<ProgramId>,
    units: [Option<TextureId>; 4],
    next_id: u32,
    surface: Option<SurfaceTarget>,
    stats: DeviceStats,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8 => wgpu::TextureFormat::Rg8Unorm,
    }
}

impl WgpuDevice {
    /// Opens a device for offscreen rendering.
    pub fn new_headless() -> GpuResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self::open(&instance, None)
    }

    /// Opens a device able to present to `surface`, created by the window
    /// collaborator from `instance`.
    pub fn for_surface(
        instance: &wgpu::Instance,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
    ) -> GpuResult<Self> {
        Self::open(instance, Some((surface, width, height)))
    }

    fn open(
        instance: &wgpu::Instance,
        surface: Option<(wgpu::Surface<'static>, u32, u32)>,
    ) -> GpuResult<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface.as_ref().map(|(s, _, _)| s),
            force_fallback_adapter: false,
        }))
        .map_err(|e| GpuError::NoAdapter(format!("{:?}", e)))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Morpheus Device"),
            required_features: wgpu::Features::empty(),
            required_limits: if surface.is_some() {
                wgpu::Limits::default()
            } else {
                wgpu::Limits::downlevel_defaults()
            },
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .map_err(|e| GpuError::DeviceCreation(e.to_string()))?;

        let adapter_name = adapter.get_info().name;
        info!("Opened GPU device on {}", adapter_name);

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Program Bind Group Layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                texture_entry(3),
                wgpu::BindGroupLayoutEntry {
                    binding: shader::SAMPLER_BINDING,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: shader::UNIFORM_BINDING,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Program Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        // Unbound units sample this zeroed texel.
        let blank = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Blank Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let blank_view = blank.create_view(&wgpu::TextureViewDescriptor::default());

        let passthrough_fragment = shader::with_prelude(PASSTHROUGH_FRAGMENT);
        let passthrough = create_program(
            &device,
            "passthrough",
            &DEFAULT_VERTEX_WITH_PRELUDE,
            "vs_main",
            &passthrough_fragment,
            "fs_main",
        );

        let surface = surface.map(|(surface, width, height)| {
            let caps = surface.get_capabilities(&adapter);
            let format = caps
                .formats
                .iter()
                .find(|f| f.is_srgb())
                .or(caps.formats.first())
                .copied()
                .unwrap_or(wgpu::TextureFormat::Bgra8UnormSrgb);
            let config = wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format,
                width: width.max(1),
                height: height.max(1),
                present_mode: wgpu::PresentMode::AutoVsync,
                alpha_mode: caps
                    .alpha_modes
                    .first()
                    .copied()
                    .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                view_formats: vec![],
                desired_maximum_frame_latency: 2,
            };
            surface.configure(&device, &config);
            SurfaceTarget { surface, config }
        });

        Ok(Self {
            device,
            queue,
            adapter_name,
            bind_group_layout,
            pipeline_layout,
            vertex_buffer,
            index_buffer,
            sampler,
            blank_view,
            passthrough,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            bound_framebuffer: None,
            active_program: None,
            units: [None; 4],
            next_id: 0,
            surface,
            stats: DeviceStats::default(),
        })
    }

    /// Reconfigures the presentation surface after a window reshape.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if let Some(target) = &mut self.surface {
            if width > 0 && height > 0 {
                target.config.width = width;
                target.config.height = height;
                target.surface.configure(&self.device, &target.config);
            }
        }
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, id: TextureId) -> GpuResult<&GpuTexture> {
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

    /// Draws the quad with the active program (or pass-through) into `view`.
    fn render_quad(
        &mut self,
        view: &wgpu::TextureView,
        format: wgpu::TextureFormat,
        transform: QuadTransform,
        use_passthrough: bool,
    ) -> GpuResult<()> {
        let program = match (use_passthrough, self.active_program) {
            (false, Some(id)) => self
                .programs
                .get_mut(&id)
                .ok_or(GpuError::UnknownProgram(id))?,
            _ => &mut self.passthrough,
        };
        if !program.pipelines.contains_key(&format) {
            let pipeline = build_pipeline(&self.device, &self.pipeline_layout, program, format);
            program.pipelines.insert(format, pipeline);
        }
        let pipeline = &program.pipelines[&format];

        let mut uniforms = program.uniforms;
        uniforms.flip_x = match transform {
            QuadTransform::Identity => 1.0,
            QuadTransform::MirrorX => -1.0,
        };
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Uniform Buffer"),
                contents: bytemuck::cast_slice(&[uniforms]),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let unit_view = |unit: TextureUnit| {
            self.units[unit.index()]
                .and_then(|id| self.textures.get(&id))
                .map(|t| &t.view)
                .unwrap_or(&self.blank_view)
        };
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Program Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(unit_view(TextureUnit::Tex)),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(unit_view(TextureUnit::Base)),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(unit_view(TextureUnit::Blend)),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(unit_view(TextureUnit::Curve)),
                },
                wgpu::BindGroupEntry {
                    binding: shader::SAMPLER_BINDING,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: shader::UNIFORM_BINDING,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Quad Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Quad Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.stats.draws += 1;
        Ok(())
    }

    fn poll_wait(&self) -> GpuResult<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| GpuError::Readback(e.to_string()))
    }
}

fn create_program(
    device: &wgpu::Device,
    label: &str,
    vertex: &str,
    vertex_entry: &str,
    fragment: &str,
    fragment_entry: &str,
) -> GpuProgram {
    let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("{} vertex", label)),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(vertex.to_string())),
    });
    let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("{} fragment", label)),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(fragment.to_string())),
    });
    GpuProgram {
        label: label.to_string(),
        vertex: vertex_module,
        fragment: fragment_module,
        vertex_entry: vertex_entry.to_string(),
        fragment_entry: fragment_entry.to_string(),
        pipelines: HashMap::new(),
        uniforms: ShaderUniforms::default(),
    }
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    program: &GpuProgram,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    debug!("Building `{}` pipeline for {:?}", program.label, format);
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&program.label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: &program.vertex,
            entry_point: Some(&program.vertex_entry),
            buffers: &[QuadVertex::layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.fragment,
            entry_point: Some(&program.fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

impl GpuDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> GpuResult<Texture> {
        check_size(width, height)?;
        let max = self.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(GpuError::OutOfMemory {
                width,
                height,
                format,
            });
        }
        let id = TextureId(self.next_id());
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&id.to_string()),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let desc = Texture {
            id,
            width,
            height,
            format,
        };
        self.textures.insert(id, GpuTexture { texture, view, desc });
        self.stats.textures_alive += 1;
        self.stats.textures_created += 1;
        self.stats.texture_bytes += format.image_bytes(width, height);
        trace!("Created {} ({}x{} {:?})", id, width, height, format);
        Ok(desc)
    }

    fn delete_texture(&mut self, texture: TextureId) -> GpuResult<()> {
        let tex = self
            .textures
            .remove(&texture)
            .ok_or(GpuError::UnknownTexture(texture))?;
        tex.texture.destroy();
        self.stats.textures_alive -= 1;
        self.stats.texture_bytes -= tex.desc.format.image_bytes(tex.desc.width, tex.desc.height);
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
        let tex = self.texture(texture)?;
        check_upload(&tex.desc, data)?;
        let Texture {
            width,
            height,
            format,
            ..
        } = tex.desc;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * format.bytes_per_texel() as u32),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureId) -> GpuResult<Vec<[f32; 4]>> {
        let tex = self.texture(texture)?;
        let Texture {
            width,
            height,
            format,
            ..
        } = tex.desc;
        let row_bytes = width * format.bytes_per_texel() as u32;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = row_bytes.div_ceil(align) * align;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.poll_wait()?;
        receiver
            .recv()
            .map_err(|e| GpuError::Readback(e.to_string()))?
            .map_err(|e| GpuError::Readback(e.to_string()))?;

        let data = slice.get_mapped_range();
        let step = format.bytes_per_texel();
        let mut texels = Vec::with_capacity(width as usize * height as usize);
        for row in data.chunks_exact(padded_row as usize) {
            texels.extend(
                row[..row_bytes as usize]
                    .chunks_exact(step)
                    .map(|bytes| decode_texel(format, bytes)),
            );
        }
        drop(data);
        readback.unmap();
        Ok(texels)
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
        let iface = shader::check_program(desc)?;
        let vertex = desc.vertex.unwrap_or(DEFAULT_VERTEX_WITH_PRELUDE.as_str());
        let mut program = create_program(
            &self.device,
            desc.label,
            vertex,
            &iface.vertex_entry,
            desc.fragment,
            &iface.fragment_entry,
        );
        let format = wgpu::TextureFormat::Rgba8Unorm;
        let pipeline = build_pipeline(&self.device, &self.pipeline_layout, &program, format);
        program.pipelines.insert(format, pipeline);

        let id = ProgramId(self.next_id());
        self.programs.insert(id, program);
        self.stats.programs_alive += 1;
        self.stats.programs_compiled += 1;
        debug!("Linked {} `{}`", id, desc.label);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) -> GpuResult<()> {
        self.programs
            .remove(&program)
            .ok_or(GpuError::UnknownProgram(program))?;
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
        let tex = self.texture(target)?;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &tex.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: color[0] as f64,
                            g: color[1] as f64,
                            b: color[2] as f64,
                            a: color[3] as f64,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn draw_quad(&mut self, transform: QuadTransform) -> GpuResult<()> {
        let target = self.render_target()?;
        if self.units.contains(&Some(target)) {
            return Err(GpuError::FeedbackLoop(target));
        }
        let tex = self.texture(target)?;
        let view = tex.view.clone();
        let format = wgpu_format(tex.desc.format);
        self.render_quad(&view, format, transform, false)
    }

    fn flush(&mut self) -> GpuResult<()> {
        self.poll_wait()?;
        self.stats.flushes += 1;
        Ok(())
    }

    fn present(&mut self, texture: TextureId) -> GpuResult<()> {
        self.texture(texture)?;
        let Some(target) = &self.surface else {
            trace!("No surface attached, skipping present of {}", texture);
            self.stats.presents += 1;
            return Ok(());
        };
        let output = target
            .surface
            .get_current_texture()
            .map_err(|e| GpuError::Surface(e.to_string()))?;
        let format = target.config.format;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let saved = self.units[TextureUnit::Tex.index()];
        self.units[TextureUnit::Tex.index()] = Some(texture);
        let result = self.render_quad(&view, format, QuadTransform::Identity, true);
        self.units[TextureUnit::Tex.index()] = saved;
        result?;

        output.present();
        self.stats.presents += 1;
        Ok(())
    }

    fn stats(&self) -> DeviceStats {
        self.stats
    }
}
