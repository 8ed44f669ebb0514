//! Boundary to the external model rendering engine. The stage never computes
//! deformation, physics or interpolation; it only decides when and on which
//! thread these calls happen.
//!
//! Engine objects are created inside the render thread (through an
//! [`EngineFactory`]) and are deliberately not `Send`, so they cannot leak to
//! caller threads.
use std::time::Duration;

use glam::Mat4;
use image::RgbaImage;
use modelpack::ModelAsset;
use sequencer::Priority;

/// Engine-side texture name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Process-level engine plus the graphics context it draws into.
pub trait RenderEngine {
    /// Context and parameter-id initialisation; runs once per context.
    fn initialize(&mut self) -> Result<(), EngineError>;

    /// Shaders and other context-bound view resources.
    fn create_view_resources(&mut self) -> Result<(), EngineError>;

    fn release_view_resources(&mut self);

    fn set_viewport(&mut self, width: u32, height: u32);

    fn create_texture(&mut self, image: &RgbaImage) -> Result<TextureId, EngineError>;

    fn delete_texture(&mut self, texture: TextureId);

    fn load_model(&mut self, asset: &ModelAsset) -> Result<Box<dyn EngineModel>, EngineError>;

    /// Final teardown when the embedding is destroyed.
    fn dispose(&mut self) {}
}

/// One engine model instance.
pub trait EngineModel {
    /// Creates the per-model renderer. Textures can only be bound afterwards.
    fn create_renderer(&mut self) -> Result<(), EngineError>;

    fn bind_texture(&mut self, slot: usize, texture: TextureId) -> Result<(), EngineError>;

    /// Canvas width in model units, used to pick the projection.
    fn canvas_width(&self) -> f32;

    /// Advances motions, physics, breathing and blinking by `delta`.
    fn update(&mut self, delta: Duration);

    fn draw(&mut self, mvp: &Mat4) -> Result<(), EngineError>;

    fn start_motion(
        &mut self,
        group: &str,
        index: usize,
        priority: Priority,
    ) -> Result<(), EngineError>;

    fn is_motion_finished(&self) -> bool;

    fn set_expression(&mut self, id: &str) -> Result<(), EngineError>;

    /// Whether the point, in view coordinates, lies inside the hit area with
    /// the given engine id.
    fn hit_test(&self, area_id: &str, x: f32, y: f32) -> bool;

    fn set_dragging(&mut self, x: f32, y: f32);

    fn set_lip_sync(&mut self, value: f32);

    fn set_auto_blink(&mut self, enabled: bool);

    fn set_auto_breath(&mut self, enabled: bool);

    /// Frees engine-side model memory. The model is not used afterwards.
    fn release(&mut self);
}

/// Builds the engine on the render thread.
pub type EngineFactory = Box<dyn FnOnce() -> Result<Box<dyn RenderEngine>, EngineError> + Send>;
