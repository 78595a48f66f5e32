//! Warp shader catalog
//!
//! Every warp shader comes in two flavors: a simple one that samples the eye
//! image once with the green-channel coordinates, and a chromatic one that
//! samples it three times with per-channel coordinates to cancel lens color
//! fringing. A few variants have no chromatic flavor and use the simple one
//! for both.

use crate::backend::{ProgramHandle, WarpBackend};
use crate::error::WarpResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProgramKind {
    Simple,
    MaskedPlane,
    MaskedPlaneExternal,
    MaskedCube,
    Cube,
    LoadingIcon,
    MiddleClamp,
    OverlayPlane,
    OverlayPlaneShowLod,
    Camera,
}

/// What the overlay layer contributes to a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OverlayBinding {
    /// Only the eye image is sampled.
    None,
    /// A second 2D image.
    Plane2D,
    /// A second image from an external producer (camera, video decoder).
    External,
    /// A cube map.
    Cube,
    /// Three cube maps, one per color plane.
    CubePlanes,
}

impl OverlayBinding {
    /// Texture units bound for this binding, eye image included.
    pub fn texture_units(self) -> usize {
        match self {
            OverlayBinding::None => 1,
            OverlayBinding::Plane2D | OverlayBinding::External | OverlayBinding::Cube => 2,
            OverlayBinding::CubePlanes => 4,
        }
    }
}

/// WGSL module and its entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderSource {
    pub label: &'static str,
    pub wgsl: &'static str,
    pub vertex_entry: &'static str,
    pub fragment_entry: &'static str,
}

const SIMPLE_WGSL: &str = include_str!("shaders/warp_simple.wgsl");
const MASKED_PLANE_WGSL: &str = include_str!("shaders/warp_masked_plane.wgsl");
const MASKED_CUBE_WGSL: &str = include_str!("shaders/warp_masked_cube.wgsl");
const CUBE_WGSL: &str = include_str!("shaders/warp_cube.wgsl");
const LOADING_ICON_WGSL: &str = include_str!("shaders/warp_loading_icon.wgsl");
const MIDDLE_CLAMP_WGSL: &str = include_str!("shaders/warp_middle_clamp.wgsl");
const OVERLAY_PLANE_WGSL: &str = include_str!("shaders/warp_overlay_plane.wgsl");
const OVERLAY_LOD_WGSL: &str = include_str!("shaders/warp_overlay_lod.wgsl");
const CAMERA_WGSL: &str = include_str!("shaders/warp_camera.wgsl");

impl ProgramKind {
    pub const ALL: [ProgramKind; 10] = [
        ProgramKind::Simple,
        ProgramKind::MaskedPlane,
        ProgramKind::MaskedPlaneExternal,
        ProgramKind::MaskedCube,
        ProgramKind::Cube,
        ProgramKind::LoadingIcon,
        ProgramKind::MiddleClamp,
        ProgramKind::OverlayPlane,
        ProgramKind::OverlayPlaneShowLod,
        ProgramKind::Camera,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn overlay_binding(self) -> OverlayBinding {
        match self {
            ProgramKind::Simple | ProgramKind::MiddleClamp => OverlayBinding::None,
            ProgramKind::MaskedPlane
            | ProgramKind::LoadingIcon
            | ProgramKind::OverlayPlane
            | ProgramKind::OverlayPlaneShowLod => OverlayBinding::Plane2D,
            ProgramKind::MaskedPlaneExternal | ProgramKind::Camera => OverlayBinding::External,
            ProgramKind::MaskedCube => OverlayBinding::Cube,
            ProgramKind::Cube => OverlayBinding::CubePlanes,
        }
    }

    /// Variants whose chromatic slot holds the simple shader.
    pub fn has_chromatic(self) -> bool {
        !matches!(self, ProgramKind::OverlayPlaneShowLod | ProgramKind::Camera)
    }

    fn wgsl(self) -> &'static str {
        match self {
            ProgramKind::Simple => SIMPLE_WGSL,
            ProgramKind::MaskedPlane | ProgramKind::MaskedPlaneExternal => MASKED_PLANE_WGSL,
            ProgramKind::MaskedCube => MASKED_CUBE_WGSL,
            ProgramKind::Cube => CUBE_WGSL,
            ProgramKind::LoadingIcon => LOADING_ICON_WGSL,
            ProgramKind::MiddleClamp => MIDDLE_CLAMP_WGSL,
            ProgramKind::OverlayPlane => OVERLAY_PLANE_WGSL,
            ProgramKind::OverlayPlaneShowLod => OVERLAY_LOD_WGSL,
            ProgramKind::Camera => CAMERA_WGSL,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ProgramKind::Simple => "warp simple",
            ProgramKind::MaskedPlane => "warp masked plane",
            ProgramKind::MaskedPlaneExternal => "warp masked plane external",
            ProgramKind::MaskedCube => "warp masked cube",
            ProgramKind::Cube => "warp cube",
            ProgramKind::LoadingIcon => "warp loading icon",
            ProgramKind::MiddleClamp => "warp middle clamp",
            ProgramKind::OverlayPlane => "warp overlay plane",
            ProgramKind::OverlayPlaneShowLod => "warp overlay plane show lod",
            ProgramKind::Camera => "warp camera",
        }
    }
}

/// Requested shader variant and flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramSelection {
    pub kind: ProgramKind,
    pub chromatic: bool,
}

impl ProgramSelection {
    pub fn simple(kind: ProgramKind) -> Self {
        Self { kind, chromatic: false }
    }

    pub fn chromatic(kind: ProgramKind) -> Self {
        Self { kind, chromatic: true }
    }

    /// The flavor actually drawn: chromatic only when requested, supported
    /// by the variant, and not disabled for this GPU.
    pub fn resolve(self, disable_chromatic: bool) -> Self {
        Self {
            kind: self.kind,
            chromatic: self.chromatic && !disable_chromatic && self.kind.has_chromatic(),
        }
    }

    pub fn source(self) -> ShaderSource {
        let (vertex_entry, fragment_entry) = if self.chromatic && self.kind.has_chromatic() {
            ("vs_chromatic", "fs_chromatic")
        } else {
            ("vs_simple", "fs_simple")
        };
        ShaderSource {
            label: self.kind.label(),
            wgsl: self.kind.wgsl(),
            vertex_entry,
            fragment_entry,
        }
    }
}

impl Default for ProgramSelection {
    fn default() -> Self {
        Self::simple(ProgramKind::Simple)
    }
}

/// Compiled program handles, `[kind][chromatic]`.
#[derive(Clone, Debug)]
pub struct WarpPrograms {
    handles: [[ProgramHandle; 2]; ProgramKind::ALL.len()],
}

impl WarpPrograms {
    pub fn build<B: WarpBackend + ?Sized>(backend: &mut B) -> WarpResult<Self> {
        let mut handles = [[ProgramHandle::default(); 2]; ProgramKind::ALL.len()];
        for kind in ProgramKind::ALL {
            let simple = ProgramSelection::simple(kind);
            let simple_handle = backend.compile_program(simple, &simple.source())?;
            let chromatic_handle = if kind.has_chromatic() {
                let chromatic = ProgramSelection::chromatic(kind);
                backend.compile_program(chromatic, &chromatic.source())?
            } else {
                simple_handle
            };
            handles[kind.index()] = [simple_handle, chromatic_handle];
        }
        Ok(Self { handles })
    }

    /// Program to draw with, plus the flavor it resolved to.
    pub fn choose(&self, requested: ProgramSelection, disable_chromatic: bool) -> (ProgramHandle, ProgramSelection) {
        let resolved = requested.resolve(disable_chromatic);
        let handle = self.handles[resolved.kind.index()][resolved.chromatic as usize];
        (handle, resolved)
    }
}
