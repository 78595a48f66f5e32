//! Error type for the warp engine
//!
//! Every variant is a condition the engine cannot render through: a GPU
//! context that could not be made, a fence that could not be created, a shader
//! that did not compile. Degraded conditions (missing extensions, stale poses,
//! idle ticks) never become errors; they are logged and absorbed.

/// Centralized error type for warp engine operations
#[derive(thiserror::Error, Debug)]
pub enum WarpError {
    #[error("GPU context error: {0}")]
    Context(String),

    #[error("GPU fence error: {0}")]
    Fence(String),

    #[error("Shader error: {0}")]
    Shader(String),

    #[error("Distortion mesh error: {0}")]
    Mesh(String),

    #[error("Texture error: {0}")]
    Texture(String),

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Warp thread error: {0}")]
    Thread(String),
}

impl WarpError {
    pub fn context<T: ToString>(msg: T) -> Self {
        WarpError::Context(msg.to_string())
    }

    pub fn fence<T: ToString>(msg: T) -> Self {
        WarpError::Fence(msg.to_string())
    }

    pub fn shader<T: ToString>(msg: T) -> Self {
        WarpError::Shader(msg.to_string())
    }

    pub fn mesh<T: ToString>(msg: T) -> Self {
        WarpError::Mesh(msg.to_string())
    }

    pub fn texture<T: ToString>(msg: T) -> Self {
        WarpError::Texture(msg.to_string())
    }

    pub fn surface<T: ToString>(msg: T) -> Self {
        WarpError::Surface(msg.to_string())
    }

    pub fn thread<T: ToString>(msg: T) -> Self {
        WarpError::Thread(msg.to_string())
    }

    /// Surface errors only cost the current frame; the backend reconfigures
    /// and the next tick tries again.
    pub fn is_transient(&self) -> bool {
        matches!(self, WarpError::Surface(_))
    }
}

/// Result type alias for warp engine operations
pub type WarpResult<T> = Result<T, WarpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_category() {
        let err = WarpError::fence("eglCreateSync returned no sync");
        assert_eq!(err.to_string(), "GPU fence error: eglCreateSync returned no sync");
        assert!(!err.is_transient());
        assert!(WarpError::surface("outdated").is_transient());
    }
}
