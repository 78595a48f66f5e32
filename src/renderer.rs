//! wgpu warp backend
//!
//! Draws the warp pass onto a wgpu surface. Eye images are registered as
//! texture views and addressed by [`TextureHandle`]; every shader variant
//! becomes a render pipeline plus a blending twin for the cursor. Draws are
//! recorded and encoded into one render pass per flush, so each eye reaches
//! the GPU before the next one is built. Fences ride on
//! `Queue::on_submitted_work_done`.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroup, BindGroupLayout, Buffer, Device, DeviceDescriptor, Instance, Queue, RenderPipeline, Surface,
    SurfaceConfiguration, SurfaceTargetUnsafe, TextureUsages,
};

use crate::backend::{
    ContextPriority, DrawCall, FenceSource, FenceStatus, GpuFence, MeshHandle, ProgramHandle, Rect, TextureBinding,
    TextureHandle, TextureTarget, WarpBackend, WarpUniforms,
};
use crate::error::{WarpError, WarpResult};
use crate::mesh::{DistortionMesh, WarpVertex};
use crate::program::{OverlayBinding, ProgramSelection, ShaderSource};

/// Uniform slots between two flushes.
const MAX_DRAWS_PER_FLUSH: u64 = 64;
const MAX_LINE_VERTICES: u64 = 1024;
const FENCE_POLL_INTERVAL: Duration = Duration::from_micros(250);

const WARP_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 5] = wgpu::vertex_attr_array![
    0 => Float32x2,
    1 => Float32x2,
    2 => Float32x2,
    3 => Float32x2,
    4 => Float32x2,
];
const LINE_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];

const OVERLAY_BINDINGS: [OverlayBinding; 5] = [
    OverlayBinding::None,
    OverlayBinding::Plane2D,
    OverlayBinding::External,
    OverlayBinding::Cube,
    OverlayBinding::CubePlanes,
];

fn binding_slot(binding: OverlayBinding) -> usize {
    match binding {
        OverlayBinding::None => 0,
        OverlayBinding::Plane2D => 1,
        OverlayBinding::External => 2,
        OverlayBinding::Cube => 3,
        OverlayBinding::CubePlanes => 4,
    }
}

#[derive(Clone)]
struct RegisteredTexture {
    view: Arc<wgpu::TextureView>,
    /// Same texels viewed without sRGB decoding, when the format allows it.
    linear: Option<Arc<wgpu::TextureView>>,
    target: TextureTarget,
}

impl RegisteredTexture {
    fn decoded_view(self, srgb_decode: bool) -> Arc<wgpu::TextureView> {
        match (srgb_decode, self.linear) {
            (false, Some(linear)) => linear,
            _ => self.view,
        }
    }
}

/// Maps texture handles to views. Registration copies the map; lookups from
/// the warp thread never block.
pub struct TextureRegistry {
    next_id: AtomicU64,
    entries: ArcSwap<HashMap<u64, RegisteredTexture>>,
}

impl TextureRegistry {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Makes `view` addressable by the returned handle.
    pub fn register(&self, view: wgpu::TextureView, target: TextureTarget) -> TextureHandle {
        self.insert(RegisteredTexture {
            view: Arc::new(view),
            linear: None,
            target,
        })
    }

    /// Registers an sRGB texture together with a non-decoding view of it,
    /// used when a frame inhibits sRGB.
    pub fn register_with_linear(
        &self,
        srgb_view: wgpu::TextureView,
        linear_view: wgpu::TextureView,
        target: TextureTarget,
    ) -> TextureHandle {
        self.insert(RegisteredTexture {
            view: Arc::new(srgb_view),
            linear: Some(Arc::new(linear_view)),
            target,
        })
    }

    fn insert(&self, entry: RegisteredTexture) -> TextureHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            entries.insert(id, entry.clone());
            entries
        });
        TextureHandle(id)
    }

    pub fn unregister(&self, handle: TextureHandle) {
        self.entries.rcu(|entries| {
            let mut entries = HashMap::clone(entries);
            entries.remove(&handle.0);
            entries
        });
    }

    fn lookup(&self, handle: TextureHandle) -> Option<RegisteredTexture> {
        if handle.is_none() {
            return None;
        }
        self.entries.load().get(&handle.0).cloned()
    }
}

struct WgpuFence {
    device: Arc<Device>,
    signaled: Arc<AtomicBool>,
}

impl GpuFence for WgpuFence {
    fn poll(&self, timeout: Duration) -> FenceStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let _ = self.device.poll(wgpu::Maintain::Poll);
            if self.signaled.load(Ordering::Acquire) {
                return FenceStatus::Signaled;
            }
            let now = Instant::now();
            if now >= deadline {
                return FenceStatus::TimeoutExpired;
            }
            std::thread::sleep(FENCE_POLL_INTERVAL.min(deadline - now));
        }
    }
}

struct WgpuFenceSource {
    device: Arc<Device>,
    queue: Arc<Queue>,
}

impl FenceSource for WgpuFenceSource {
    fn create_fence(&self) -> WarpResult<Box<dyn GpuFence>> {
        let signaled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&signaled);
        self.queue
            .on_submitted_work_done(move || flag.store(true, Ordering::Release));
        Ok(Box::new(WgpuFence {
            device: Arc::clone(&self.device),
            signaled,
        }))
    }
}

struct CompiledProgram {
    binding: OverlayBinding,
    opaque: RenderPipeline,
    blended: RenderPipeline,
}

struct GpuMesh {
    vertices: Buffer,
    indices: Buffer,
}

struct FrameTarget {
    texture: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
    cleared: bool,
}

enum PendingOp {
    Mesh {
        program: usize,
        blend: bool,
        uniform_offset: u32,
        textures: BindGroup,
        mesh: usize,
        indices: Range<u32>,
        scissor: Rect,
    },
    Clear {
        uniform_offset: u32,
        scissor: Rect,
    },
    Lines {
        uniform_offset: u32,
        viewport: Rect,
        scissor: Rect,
        vertices: Range<u32>,
    },
}

pub struct WgpuBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    surface: Surface<'static>,
    config: SurfaceConfiguration,
    adapter_name: String,

    textures: Arc<TextureRegistry>,
    sampler: wgpu::Sampler,
    fallback_2d: Arc<wgpu::TextureView>,
    fallback_cube: Arc<wgpu::TextureView>,

    uniform_layout: BindGroupLayout,
    uniform_buffer: Buffer,
    uniform_bind_group: BindGroup,
    uniform_stride: u64,
    next_uniform: u64,
    texture_layouts: [BindGroupLayout; 5],

    programs: Vec<CompiledProgram>,
    meshes: Vec<GpuMesh>,

    clear_pipeline: RenderPipeline,
    line_pipeline: RenderPipeline,
    line_buffer: Buffer,
    next_line_vertex: u64,

    frame: Option<FrameTarget>,
    pending: Vec<PendingOp>,
}

impl WgpuBackend {
    /// Creates a surface for a native window.
    ///
    /// # Safety
    ///
    /// The window must outlive the returned surface.
    pub unsafe fn create_surface(
        instance: &Instance,
        window: &(impl HasWindowHandle + HasDisplayHandle),
    ) -> WarpResult<Surface<'static>> {
        let raw_window_handle = window.window_handle().map_err(WarpError::surface)?.as_raw();
        let raw_display_handle = window.display_handle().map_err(WarpError::surface)?.as_raw();
        let target = SurfaceTargetUnsafe::RawHandle {
            raw_display_handle,
            raw_window_handle,
        };
        unsafe { instance.create_surface_unsafe(target) }.map_err(WarpError::surface)
    }

    /// Picks an adapter for `surface`, creates the device, and configures
    /// the surface for vsync-locked presentation.
    pub async fn new(instance: &Instance, surface: Surface<'static>, width: u32, height: u32) -> WarpResult<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| WarpError::context("no GPU adapter for the surface"))?;

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("Warp Device"),
                    ..Default::default()
                },
                None,
            )
            .await
            .map_err(WarpError::context)?;

        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .first()
            .copied()
            .ok_or_else(|| WarpError::surface("surface reports no formats"))?;

        let config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let adapter_name = adapter.get_info().name;
        info!("Warp backend on {} ({:?}, {}x{})", adapter_name, format, config.width, config.height);

        Ok(Self::with_device(
            Arc::new(device),
            Arc::new(queue),
            surface,
            config,
            adapter_name,
        ))
    }

    /// Builds the backend on an existing device and configured surface.
    pub fn with_device(
        device: Arc<Device>,
        queue: Arc<Queue>,
        surface: Surface<'static>,
        config: SurfaceConfiguration,
        adapter_name: String,
    ) -> Self {
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Warp Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let fallback_2d = Arc::new(placeholder_view(&device, 1, wgpu::TextureViewDimension::D2));
        let fallback_cube = Arc::new(placeholder_view(&device, 6, wgpu::TextureViewDimension::Cube));

        let uniform_size = std::mem::size_of::<WarpUniforms>() as u64;
        let alignment = u64::from(device.limits().min_uniform_buffer_offset_alignment).max(1);
        let uniform_stride = uniform_size.div_ceil(alignment) * alignment;

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Warp Uniform Buffer"),
            size: uniform_stride * MAX_DRAWS_PER_FLUSH,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Warp Uniform Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: wgpu::BufferSize::new(uniform_size),
                },
                count: None,
            }],
        });

        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Warp Uniform Bind Group"),
            layout: &uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &uniform_buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(uniform_size),
                }),
            }],
        });

        let texture_layouts = OVERLAY_BINDINGS.map(|binding| create_texture_layout(&device, binding));

        let solid_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Warp Solid Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout],
            push_constant_ranges: &[],
        });

        let clear_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Warp Clear Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/solid.wgsl").into()),
        });
        let clear_pipeline = create_pipeline(
            &device,
            "Warp Clear Pipeline",
            &solid_layout,
            &clear_shader,
            ("vs_main", "fs_main"),
            &[],
            config.format,
            false,
            wgpu::PrimitiveTopology::TriangleList,
        );

        let line_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Warp Line Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/lines.wgsl").into()),
        });
        let line_pipeline = create_pipeline(
            &device,
            "Warp Line Pipeline",
            &solid_layout,
            &line_shader,
            ("vs_main", "fs_main"),
            &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<[f32; 2]>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &LINE_VERTEX_ATTRIBUTES,
            }],
            config.format,
            false,
            wgpu::PrimitiveTopology::LineList,
        );

        let line_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Warp Line Buffer"),
            size: MAX_LINE_VERTICES * std::mem::size_of::<[f32; 2]>() as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            device,
            queue,
            surface,
            config,
            adapter_name,
            textures: Arc::new(TextureRegistry::new()),
            sampler,
            fallback_2d,
            fallback_cube,
            uniform_layout,
            uniform_buffer,
            uniform_bind_group,
            uniform_stride,
            next_uniform: 0,
            texture_layouts,
            programs: Vec::new(),
            meshes: Vec::new(),
            clear_pipeline,
            line_pipeline,
            line_buffer,
            next_line_vertex: 0,
            frame: None,
            pending: Vec::new(),
        }
    }

    /// Registry the application uses to turn its eye textures into handles.
    pub fn texture_registry(&self) -> Arc<TextureRegistry> {
        Arc::clone(&self.textures)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            self.surface.configure(&self.device, &self.config);
        }
    }

    fn push_uniforms(&mut self, uniforms: &WarpUniforms) -> u32 {
        if self.next_uniform == MAX_DRAWS_PER_FLUSH {
            warn!("More than {} warp draws before a flush; reusing uniform slots", MAX_DRAWS_PER_FLUSH);
        }
        let offset = (self.next_uniform % MAX_DRAWS_PER_FLUSH) * self.uniform_stride;
        self.next_uniform += 1;
        self.queue
            .write_buffer(&self.uniform_buffer, offset, bytemuck::bytes_of(uniforms));
        offset as u32
    }

    fn view_for(&self, textures: &[TextureBinding], unit: u32, cube: bool) -> Arc<wgpu::TextureView> {
        textures
            .iter()
            .find(|binding| binding.unit == unit)
            .and_then(|binding| {
                self.textures
                    .lookup(binding.texture)
                    .map(|registered| (registered, binding.srgb_decode))
            })
            .filter(|(registered, _)| (registered.target == TextureTarget::CubeMap) == cube)
            .map(|(registered, srgb_decode)| registered.decoded_view(srgb_decode))
            .unwrap_or_else(|| {
                if cube {
                    Arc::clone(&self.fallback_cube)
                } else {
                    Arc::clone(&self.fallback_2d)
                }
            })
    }

    fn texture_bind_group(&self, binding: OverlayBinding, textures: &[TextureBinding]) -> BindGroup {
        let mut views = vec![self.view_for(textures, 0, false)];
        match binding {
            OverlayBinding::None => {}
            OverlayBinding::Plane2D | OverlayBinding::External => views.push(self.view_for(textures, 1, false)),
            OverlayBinding::Cube => views.push(self.view_for(textures, 1, true)),
            OverlayBinding::CubePlanes => {
                for unit in 1..4 {
                    views.push(self.view_for(textures, unit, true));
                }
            }
        }

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&views[0]),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        for (unit, view) in views.iter().enumerate().skip(1) {
            entries.push(wgpu::BindGroupEntry {
                binding: unit as u32 + 1,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }

        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Warp Texture Bind Group"),
            layout: &self.texture_layouts[binding_slot(binding)],
            entries: &entries,
        })
    }

    fn create_warp_pipeline(
        &self,
        source: &ShaderSource,
        module: &wgpu::ShaderModule,
        binding: OverlayBinding,
        blend: bool,
    ) -> RenderPipeline {
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(source.label),
            bind_group_layouts: &[&self.uniform_layout, &self.texture_layouts[binding_slot(binding)]],
            push_constant_ranges: &[],
        });
        create_pipeline(
            &self.device,
            source.label,
            &layout,
            module,
            (source.vertex_entry, source.fragment_entry),
            &[wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<WarpVertex>() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &WARP_VERTEX_ATTRIBUTES,
            }],
            self.config.format,
            blend,
            wgpu::PrimitiveTopology::TriangleList,
        )
    }

    /// Encodes everything recorded since the last flush into one pass.
    fn encode_pending(&mut self) {
        let ops = std::mem::take(&mut self.pending);
        let (width, height) = (self.config.width, self.config.height);
        let Some(frame) = self.frame.as_mut() else {
            return;
        };
        if ops.is_empty() && frame.cleared {
            return;
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Warp Encoder"),
        });
        {
            let load = if frame.cleared {
                wgpu::LoadOp::Load
            } else {
                wgpu::LoadOp::Clear(wgpu::Color::BLACK)
            };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Warp Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &frame.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for op in &ops {
                match op {
                    PendingOp::Mesh {
                        program,
                        blend,
                        uniform_offset,
                        textures,
                        mesh,
                        indices,
                        scissor,
                    } => {
                        let Some(scissor) = clamp_rect(*scissor, width, height) else {
                            continue;
                        };
                        let compiled = &self.programs[*program];
                        let mesh = &self.meshes[*mesh];
                        pass.set_pipeline(if *blend { &compiled.blended } else { &compiled.opaque });
                        pass.set_bind_group(0, &self.uniform_bind_group, &[*uniform_offset]);
                        pass.set_bind_group(1, textures, &[]);
                        pass.set_vertex_buffer(0, mesh.vertices.slice(..));
                        pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint16);
                        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
                        pass.draw_indexed(indices.clone(), 0, 0..1);
                    }
                    PendingOp::Clear {
                        uniform_offset,
                        scissor,
                    } => {
                        let Some(scissor) = clamp_rect(*scissor, width, height) else {
                            continue;
                        };
                        pass.set_pipeline(&self.clear_pipeline);
                        pass.set_bind_group(0, &self.uniform_bind_group, &[*uniform_offset]);
                        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
                        pass.draw(0..3, 0..1);
                    }
                    PendingOp::Lines {
                        uniform_offset,
                        viewport,
                        scissor,
                        vertices,
                    } => {
                        let (Some(viewport), Some(scissor)) =
                            (clamp_rect(*viewport, width, height), clamp_rect(*scissor, width, height))
                        else {
                            continue;
                        };
                        pass.set_pipeline(&self.line_pipeline);
                        pass.set_bind_group(0, &self.uniform_bind_group, &[*uniform_offset]);
                        pass.set_vertex_buffer(0, self.line_buffer.slice(..));
                        pass.set_viewport(
                            viewport.x as f32,
                            viewport.y as f32,
                            viewport.width as f32,
                            viewport.height as f32,
                            0.0,
                            1.0,
                        );
                        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
                        pass.draw(vertices.clone(), 0..1);
                        pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
                    }
                }
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        frame.cleared = true;
        self.next_uniform = 0;
    }
}

impl WarpBackend for WgpuBackend {
    fn surface_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn renderer_name(&self) -> String {
        self.adapter_name.clone()
    }

    fn fence_source(&self) -> Arc<dyn FenceSource> {
        Arc::new(WgpuFenceSource {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
        })
    }

    fn enter_warp_thread(&mut self, requested: ContextPriority) -> WarpResult<ContextPriority> {
        if requested > ContextPriority::Medium {
            info!("wgpu exposes no queue priority; warp thread runs at medium");
        }
        Ok(ContextPriority::Medium)
    }

    fn compile_program(&mut self, selection: ProgramSelection, source: &ShaderSource) -> WarpResult<ProgramHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.label),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.into()),
        });
        let binding = selection.kind.overlay_binding();
        let opaque = self.create_warp_pipeline(source, &module, binding, false);
        let blended = self.create_warp_pipeline(source, &module, binding, true);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(WarpError::shader(format!(
                "{} ({}/{}): {}",
                source.label, source.vertex_entry, source.fragment_entry, err
            )));
        }

        self.programs.push(CompiledProgram {
            binding,
            opaque,
            blended,
        });
        Ok(ProgramHandle(self.programs.len() as u32 - 1))
    }

    fn upload_mesh(&mut self, mesh: &DistortionMesh) -> WarpResult<MeshHandle> {
        if mesh.vertices.is_empty() || mesh.indices.is_empty() {
            return Err(WarpError::mesh("cannot upload an empty mesh"));
        }
        let vertices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Warp Mesh Vertices"),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let indices = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Warp Mesh Indices"),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        self.meshes.push(GpuMesh { vertices, indices });
        Ok(MeshHandle(self.meshes.len() as u32 - 1))
    }

    fn create_texture_rgba(&mut self, width: u32, height: u32, pixels: &[u8]) -> WarpResult<TextureHandle> {
        if pixels.len() != (width * height * 4) as usize {
            return Err(WarpError::texture(format!(
                "{} bytes for a {}x{} RGBA texture",
                pixels.len(),
                width,
                height
            )));
        }
        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Warp Framework Texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[wgpu::TextureFormat::Rgba8Unorm],
        });
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            size,
        );
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let linear = texture.create_view(&wgpu::TextureViewDescriptor {
            format: Some(wgpu::TextureFormat::Rgba8Unorm),
            ..Default::default()
        });
        Ok(self
            .textures
            .register_with_linear(view, linear, TextureTarget::Texture2D))
    }

    fn finish(&mut self) {
        let _ = self.device.poll(wgpu::Maintain::Wait);
    }

    fn begin_frame(&mut self, _framebuffer_srgb: Option<bool>) -> WarpResult<()> {
        self.pending.clear();
        self.next_uniform = 0;
        self.next_line_vertex = 0;
        self.frame = None;

        match self.surface.get_current_texture() {
            Ok(texture) => {
                let view = texture.texture.create_view(&wgpu::TextureViewDescriptor::default());
                self.frame = Some(FrameTarget {
                    texture,
                    view,
                    cleared: false,
                });
                Ok(())
            }
            Err(err) => {
                self.surface.configure(&self.device, &self.config);
                Err(WarpError::surface(err))
            }
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        if self.frame.is_none() {
            return;
        }
        let Some(program) = self.programs.get(call.program.0 as usize) else {
            warn!("Draw with unknown program {:?}", call.program);
            return;
        };
        if call.mesh.0 as usize >= self.meshes.len() {
            warn!("Draw with unknown mesh {:?}", call.mesh);
            return;
        }

        let textures = self.texture_bind_group(program.binding, call.textures);
        let uniform_offset = self.push_uniforms(call.uniforms);
        self.pending.push(PendingOp::Mesh {
            program: call.program.0 as usize,
            blend: call.blend,
            uniform_offset,
            textures,
            mesh: call.mesh.0 as usize,
            indices: call.first_index..call.first_index + call.index_count,
            scissor: call.scissor,
        });
    }

    fn clear_rect(&mut self, rect: Rect, color: [f32; 4]) {
        if self.frame.is_none() {
            return;
        }
        let uniform_offset = self.push_uniforms(&WarpUniforms {
            color,
            ..WarpUniforms::default()
        });
        self.pending.push(PendingOp::Clear {
            uniform_offset,
            scissor: rect,
        });
    }

    fn draw_lines(&mut self, viewport: Rect, scissor: Rect, vertices: &[[f32; 2]], color: [f32; 4]) {
        if self.frame.is_none() || vertices.is_empty() {
            return;
        }
        let count = vertices.len() as u64;
        if self.next_line_vertex + count > MAX_LINE_VERTICES {
            warn!("Line buffer full, dropping {} vertices", count);
            return;
        }

        let first = self.next_line_vertex;
        self.queue.write_buffer(
            &self.line_buffer,
            first * std::mem::size_of::<[f32; 2]>() as u64,
            bytemuck::cast_slice(vertices),
        );
        self.next_line_vertex += count;

        let uniform_offset = self.push_uniforms(&WarpUniforms {
            color,
            ..WarpUniforms::default()
        });
        self.pending.push(PendingOp::Lines {
            uniform_offset,
            viewport,
            scissor,
            vertices: first as u32..(first + count) as u32,
        });
    }

    fn flush(&mut self) {
        self.encode_pending();
    }

    fn present(&mut self) -> WarpResult<()> {
        self.encode_pending();
        let frame = self
            .frame
            .take()
            .ok_or_else(|| WarpError::surface("present without an acquired frame"))?;
        frame.texture.present();
        Ok(())
    }
}

fn placeholder_view(device: &Device, layers: u32, dimension: wgpu::TextureViewDimension) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Warp Placeholder Texture"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: layers,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(dimension),
        ..Default::default()
    })
}

fn texture_entry(binding: u32, view_dimension: wgpu::TextureViewDimension) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension,
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
        },
        count: None,
    }
}

fn create_texture_layout(device: &Device, binding: OverlayBinding) -> BindGroupLayout {
    let mut entries = vec![
        texture_entry(0, wgpu::TextureViewDimension::D2),
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ];
    match binding {
        OverlayBinding::None => {}
        OverlayBinding::Plane2D | OverlayBinding::External => {
            entries.push(texture_entry(2, wgpu::TextureViewDimension::D2));
        }
        OverlayBinding::Cube => entries.push(texture_entry(2, wgpu::TextureViewDimension::Cube)),
        OverlayBinding::CubePlanes => {
            for slot in 2..5 {
                entries.push(texture_entry(slot, wgpu::TextureViewDimension::Cube));
            }
        }
    }
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Warp Texture Layout"),
        entries: &entries,
    })
}

#[allow(clippy::too_many_arguments)]
fn create_pipeline(
    device: &Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    (vertex_entry, fragment_entry): (&str, &str),
    buffers: &[wgpu::VertexBufferLayout<'_>],
    format: wgpu::TextureFormat,
    blend: bool,
    topology: wgpu::PrimitiveTopology,
) -> RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(vertex_entry),
            buffers,
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(if blend {
                    wgpu::BlendState::ALPHA_BLENDING
                } else {
                    wgpu::BlendState::REPLACE
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// Intersects `rect` with the target; `None` when nothing is left.
fn clamp_rect(rect: Rect, width: u32, height: u32) -> Option<Rect> {
    let x = rect.x.min(width);
    let y = rect.y.min(height);
    let clamped = Rect {
        x,
        y,
        width: rect.width.min(width - x),
        height: rect.height.min(height - y),
    };
    (clamped.width > 0 && clamped.height > 0).then_some(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scissor_is_clipped_to_target() {
        let inside = Rect { x: 10, y: 0, width: 20, height: 40 };
        assert_eq!(clamp_rect(inside, 100, 100), Some(inside));

        let overhang = Rect { x: 90, y: 0, width: 20, height: 200 };
        assert_eq!(
            clamp_rect(overhang, 100, 100),
            Some(Rect { x: 90, y: 0, width: 10, height: 100 })
        );

        let outside = Rect { x: 120, y: 0, width: 20, height: 20 };
        assert_eq!(clamp_rect(outside, 100, 100), None);
    }

    #[test]
    fn every_binding_has_a_layout_slot() {
        let mut slots: Vec<usize> = OVERLAY_BINDINGS.iter().map(|b| binding_slot(*b)).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);
    }
}
