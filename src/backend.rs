//! GPU abstraction the warp driver draws through
//!
//! The driver never talks to a graphics API directly. It asks a
//! [`WarpBackend`] to compile the shader catalog, upload meshes, and record
//! scissored, indexed draws; fences come from a [`FenceSource`] that the
//! submitting thread can reach without touching the backend.

use std::sync::Arc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::error::WarpResult;
use crate::mesh::DistortionMesh;
use crate::program::{ProgramSelection, ShaderSource};

/// Application texture id. `0` means no texture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

impl TextureHandle {
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

/// Pixel rectangle, origin at the left of the surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    #[default]
    Texture2D,
    External,
    CubeMap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureBinding {
    pub unit: u32,
    pub target: TextureTarget,
    pub texture: TextureHandle,
    /// Sample sRGB textures with decoding to linear; off passes the stored
    /// values through.
    pub srgb_decode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimeoutExpired,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextPriority {
    Low,
    Medium,
    High,
}

/// GPU completion marker inserted after a frame's rendering commands.
pub trait GpuFence: Send + Sync {
    /// Waits up to `timeout` for the fence. A zero timeout only queries.
    fn poll(&self, timeout: Duration) -> FenceStatus;
}

/// Creates fences on the submitting thread.
pub trait FenceSource: Send + Sync {
    fn create_fence(&self) -> WarpResult<Box<dyn GpuFence>>;
}

/// Uniform block shared by every warp shader. Matrices are column-major.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct WarpUniforms {
    pub mvp: [[f32; 4]; 4],
    /// Primary layer, leading scan edge.
    pub tex_m: [[f32; 4]; 4],
    /// Primary layer, trailing scan edge.
    pub tex_m2: [[f32; 4]; 4],
    /// Overlay layer, leading and trailing.
    pub tex_m3: [[f32; 4]; 4],
    pub tex_m4: [[f32; 4]; 4],
    /// Rotation between the two scan edge poses.
    pub tex_m5: [[f32; 4]; 4],
    pub tex_clamp: [f32; 4],
    pub rotate_scale: [f32; 4],
    pub color: [f32; 4],
}

impl Default for WarpUniforms {
    fn default() -> Self {
        let identity = Mat4::IDENTITY.to_cols_array_2d();
        Self {
            mvp: identity,
            tex_m: identity,
            tex_m2: identity,
            tex_m3: identity,
            tex_m4: identity,
            tex_m5: identity,
            tex_clamp: [0.0, 1.0, 0.0, 0.0],
            rotate_scale: [0.0, 1.0, 1.0, 1.0],
            color: [1.0; 4],
        }
    }
}

/// One scissored, indexed draw of part of a mesh.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub uniforms: &'a WarpUniforms,
    pub textures: &'a [TextureBinding],
    pub mesh: MeshHandle,
    pub first_index: u32,
    pub index_count: u32,
    pub scissor: Rect,
    pub blend: bool,
}

pub trait WarpBackend: Send + 'static {
    /// Drawable size in pixels.
    fn surface_size(&self) -> (u32, u32);

    /// GPU renderer string, matched against the chromatic blacklist.
    fn renderer_name(&self) -> String;

    fn fence_source(&self) -> Arc<dyn FenceSource>;

    /// Whether framebuffer sRGB conversion can be switched per frame.
    fn has_srgb_write_control(&self) -> bool {
        false
    }

    /// Called on the warp thread before its first frame. Returns the
    /// priority actually obtained.
    fn enter_warp_thread(&mut self, requested: ContextPriority) -> WarpResult<ContextPriority>;

    /// Called on the warp thread after its last frame.
    fn leave_warp_thread(&mut self) -> WarpResult<()> {
        Ok(())
    }

    fn compile_program(&mut self, selection: ProgramSelection, source: &ShaderSource) -> WarpResult<ProgramHandle>;

    fn upload_mesh(&mut self, mesh: &DistortionMesh) -> WarpResult<MeshHandle>;

    fn create_texture_rgba(&mut self, width: u32, height: u32, pixels: &[u8]) -> WarpResult<TextureHandle>;

    /// Blocks until all previously submitted GPU work has completed.
    fn finish(&mut self);

    /// Starts a frame. `framebuffer_srgb` is `None` when sRGB write control
    /// is unavailable. Surface errors are transient and skip the frame.
    fn begin_frame(&mut self, framebuffer_srgb: Option<bool>) -> WarpResult<()>;

    fn draw(&mut self, call: &DrawCall<'_>);

    fn clear_rect(&mut self, rect: Rect, color: [f32; 4]);

    /// Line list in `viewport`-relative normalized coordinates.
    fn draw_lines(&mut self, viewport: Rect, scissor: Rect, vertices: &[[f32; 2]], color: [f32; 4]);

    /// Pushes recorded work to the GPU without presenting.
    fn flush(&mut self) {}

    fn present(&mut self) -> WarpResult<()>;
}
