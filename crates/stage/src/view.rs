//! Coordinate spaces between the host surface and the engine.
//!
//! - *device*: surface pixels, origin top-left, y down.
//! - *screen*: logical units, origin at the surface centre, y up, the shorter
//!   surface axis spanning -1..1.
//! - *view*: screen with the model's user offset and scale undone; this is
//!   what hit testing and drag targets use.
//!
//! A model is drawn with `projection · translate(offset) · scale(user_scale)`:
//! the user scale is applied about the model origin, the offset moves the
//! scaled model in logical units, and the projection corrects for aspect.
use glam::{Mat4, Vec2, Vec3};

use crate::types::ModelState;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewTransform {
    width: f32,
    height: f32,
}

impl ViewTransform {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width as f32;
        self.height = height as f32;
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn device_to_screen(&self, x: f32, y: f32) -> Vec2 {
        if self.is_degenerate() {
            return Vec2::ZERO;
        }
        let scale = 2.0 / self.width.min(self.height);
        Vec2::new(
            (x - self.width * 0.5) * scale,
            -(y - self.height * 0.5) * scale,
        )
    }

    pub fn screen_to_view(&self, point: Vec2, state: &ModelState) -> Vec2 {
        let offset = Vec2::new(state.offset.0, state.offset.1);
        let scale = if state.scale > 0.0 { state.scale } else { 1.0 };
        (point - offset) / scale
    }

    pub fn device_to_view(&self, x: f32, y: f32, state: &ModelState) -> Vec2 {
        self.screen_to_view(self.device_to_screen(x, y), state)
    }

    /// Aspect correction. Tall canvases on portrait surfaces are fitted to
    /// the width, everything else to the height.
    pub fn projection(&self, canvas_width: f32) -> Mat4 {
        if self.is_degenerate() {
            return Mat4::IDENTITY;
        }
        if canvas_width > 1.0 && self.width < self.height {
            Mat4::from_scale(Vec3::new(1.0, self.width / self.height, 1.0))
        } else {
            Mat4::from_scale(Vec3::new(self.height / self.width, 1.0, 1.0))
        }
    }

    pub fn model_view_projection(&self, canvas_width: f32, state: &ModelState) -> Mat4 {
        self.projection(canvas_width)
            * Mat4::from_translation(Vec3::new(state.offset.0, state.offset.1, 0.0))
            * Mat4::from_scale(Vec3::new(state.scale, state.scale, 1.0))
    }
}

/// Single-pointer touch state. Moves only count while a touch is captured.
#[derive(Clone, Copy, Debug, Default)]
pub struct TouchTracker {
    captured: bool,
    last: Vec2,
}

impl TouchTracker {
    pub fn began(&mut self, x: f32, y: f32) {
        self.captured = true;
        self.last = Vec2::new(x, y);
    }

    /// Returns false when no touch is captured.
    pub fn moved(&mut self, x: f32, y: f32) -> bool {
        if !self.captured {
            return false;
        }
        self.last = Vec2::new(x, y);
        true
    }

    /// Releases the capture, returning where the touch ended.
    pub fn ended(&mut self, x: f32, y: f32) -> Option<Vec2> {
        if !self.captured {
            return None;
        }
        self.captured = false;
        self.last = Vec2::new(x, y);
        Some(self.last)
    }

    pub fn is_captured(&self) -> bool {
        self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec2, b: Vec2) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn short_axis_spans_unit_range() {
        let landscape = ViewTransform::new(800, 400);
        assert!(approx(landscape.device_to_screen(400.0, 200.0), Vec2::ZERO));
        assert!(approx(landscape.device_to_screen(400.0, 0.0), Vec2::new(0.0, 1.0)));
        assert!(approx(landscape.device_to_screen(800.0, 400.0), Vec2::new(2.0, -1.0)));

        let portrait = ViewTransform::new(400, 800);
        assert!(approx(portrait.device_to_screen(0.0, 400.0), Vec2::new(-1.0, 0.0)));
    }

    #[test]
    fn user_transform_scales_then_offsets() {
        let square = ViewTransform::new(500, 500);
        let state = ModelState {
            scale: 2.0,
            offset: (0.5, 0.0),
            ..ModelState::default()
        };
        let mvp = square.model_view_projection(1.0, &state);
        let moved = mvp.transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!((moved - Vec3::new(2.5, 0.0, 0.0)).length() < 1e-5);

        let back = square.screen_to_view(Vec2::new(2.5, 0.0), &state);
        assert!(approx(back, Vec2::new(1.0, 0.0)));
    }

    #[test]
    fn projection_corrects_aspect() {
        let landscape = ViewTransform::new(800, 400);
        let p = landscape.projection(1.0).transform_point3(Vec3::new(1.0, 1.0, 0.0));
        assert!((p - Vec3::new(0.5, 1.0, 0.0)).length() < 1e-5);

        let portrait = ViewTransform::new(400, 800);
        let p = portrait.projection(2.0).transform_point3(Vec3::new(1.0, 1.0, 0.0));
        assert!((p - Vec3::new(1.0, 0.5, 0.0)).length() < 1e-5);
    }

    #[test]
    fn moves_require_capture() {
        let mut touch = TouchTracker::default();
        assert!(!touch.moved(1.0, 1.0));
        assert_eq!(touch.ended(1.0, 1.0), None);

        touch.began(10.0, 20.0);
        assert!(touch.moved(12.0, 22.0));
        assert_eq!(touch.ended(14.0, 24.0), Some(Vec2::new(14.0, 24.0)));
        assert!(!touch.is_captured());
    }
}
