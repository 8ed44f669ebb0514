//! Engine without a graphics context. It keeps the bookkeeping a real engine
//! would (textures, bound slots, motion timing, expressions) so the stage can
//! be driven from a terminal or in CI.
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use glam::Mat4;
use image::RgbaImage;
use modelpack::{ModelAsset, MotionKey};
use stage::{EngineError, EngineFactory, EngineModel, Priority, RenderEngine, TextureId};
use tracing::{debug, trace, warn};

/// Used when a motion file carries no usable `Meta.Duration`.
const FALLBACK_MOTION_SECONDS: f32 = 1.0;

const DEFAULT_CANVAS_WIDTH: f32 = 2.0;

#[derive(Debug, Default)]
pub struct HeadlessEngine {
    initialized: bool,
    next_texture: u32,
    live_textures: BTreeSet<TextureId>,
    viewport: (u32, u32),
}

impl HeadlessEngine {
    pub fn factory() -> EngineFactory {
        Box::new(|| {
            let engine: Box<dyn RenderEngine> = Box::new(HeadlessEngine::default());
            Ok(engine)
        })
    }

    pub fn live_textures(&self) -> usize {
        self.live_textures.len()
    }
}

impl RenderEngine for HeadlessEngine {
    fn initialize(&mut self) -> Result<(), EngineError> {
        self.initialized = true;
        debug!("headless engine initialised");
        Ok(())
    }

    fn create_view_resources(&mut self) -> Result<(), EngineError> {
        if !self.initialized {
            return Err(EngineError::new("view resources need an initialised engine"));
        }
        Ok(())
    }

    fn release_view_resources(&mut self) {
        trace!("view resources released");
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        debug!(width, height, "viewport set");
    }

    fn create_texture(&mut self, image: &RgbaImage) -> Result<TextureId, EngineError> {
        self.next_texture += 1;
        let texture = TextureId(self.next_texture);
        self.live_textures.insert(texture);
        trace!(
            texture = texture.0,
            width = image.width(),
            height = image.height(),
            "texture created"
        );
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if !self.live_textures.remove(&texture) {
            warn!(texture = texture.0, "deleting unknown texture");
        }
    }

    fn load_model(&mut self, asset: &ModelAsset) -> Result<Box<dyn EngineModel>, EngineError> {
        if asset.moc.is_empty() {
            return Err(EngineError::new(format!(
                "empty moc data in {}",
                asset.manifest_path.display()
            )));
        }
        Ok(Box::new(HeadlessModel::new(asset)))
    }

    fn dispose(&mut self) {
        if self.live_textures() > 0 {
            warn!(count = self.live_textures(), "textures still alive at dispose");
        }
        debug!(viewport = ?self.viewport, "headless engine disposed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Band {
    min_y: f32,
    max_y: f32,
}

impl Band {
    fn contains(&self, x: f32, y: f32) -> bool {
        x.abs() <= 0.5 && y >= self.min_y && y < self.max_y
    }
}

#[derive(Debug)]
struct Playing {
    key: MotionKey,
    priority: Priority,
    remaining: Duration,
}

/// Hit areas are approximated by horizontal bands: `Head` covers the top of
/// the canvas and `Body` the rest. Any other area never hits.
#[derive(Debug)]
pub struct HeadlessModel {
    durations: BTreeMap<MotionKey, Duration>,
    expressions: BTreeSet<String>,
    bands: BTreeMap<String, Band>,
    canvas_width: f32,
    renderer: bool,
    bound: BTreeMap<usize, TextureId>,
    playing: Option<Playing>,
    expression: Option<String>,
    drag: (f32, f32),
    lip_sync: f32,
    auto_blink: bool,
    auto_breath: bool,
    released: bool,
}

impl HeadlessModel {
    fn new(asset: &ModelAsset) -> Self {
        let durations = asset
            .motions
            .iter()
            .map(|(key, motion)| {
                let duration = motion
                    .meta()
                    .map(|meta| meta.duration)
                    .filter(|d| *d > 0.0)
                    .and_then(|d| Duration::try_from_secs_f32(d).ok())
                    .unwrap_or(Duration::from_secs_f32(FALLBACK_MOTION_SECONDS));
                (key.clone(), duration)
            })
            .collect();

        let bands = asset
            .hit_areas
            .iter()
            .filter_map(|(name, id)| {
                let band = if name.eq_ignore_ascii_case("head") {
                    Band {
                        min_y: 0.3,
                        max_y: 1.0,
                    }
                } else if name.eq_ignore_ascii_case("body") {
                    Band {
                        min_y: -1.0,
                        max_y: 0.3,
                    }
                } else {
                    return None;
                };
                Some((id.clone(), band))
            })
            .collect();

        Self {
            durations,
            expressions: asset.expressions.keys().cloned().collect(),
            bands,
            canvas_width: asset
                .layout
                .get("Width")
                .copied()
                .unwrap_or(DEFAULT_CANVAS_WIDTH),
            renderer: false,
            bound: BTreeMap::new(),
            playing: None,
            expression: None,
            drag: (0.0, 0.0),
            lip_sync: 0.0,
            auto_blink: true,
            auto_breath: true,
            released: false,
        }
    }

    fn playing_unfinished(&self) -> Option<&Playing> {
        self.playing.as_ref().filter(|p| !p.remaining.is_zero())
    }
}

impl EngineModel for HeadlessModel {
    fn create_renderer(&mut self) -> Result<(), EngineError> {
        self.renderer = true;
        Ok(())
    }

    fn bind_texture(&mut self, slot: usize, texture: TextureId) -> Result<(), EngineError> {
        if !self.renderer {
            return Err(EngineError::new("renderer not created"));
        }
        self.bound.insert(slot, texture);
        Ok(())
    }

    fn canvas_width(&self) -> f32 {
        self.canvas_width
    }

    fn update(&mut self, delta: Duration) {
        if let Some(playing) = self.playing.as_mut() {
            playing.remaining = playing.remaining.saturating_sub(delta);
        }
    }

    fn draw(&mut self, mvp: &Mat4) -> Result<(), EngineError> {
        if self.released {
            return Err(EngineError::new("draw after release"));
        }
        if !mvp.is_finite() {
            return Err(EngineError::new("non-finite projection"));
        }
        trace!(
            slots = self.bound.len(),
            expression = ?self.expression,
            drag = ?self.drag,
            lip_sync = self.lip_sync,
            blink = self.auto_blink,
            breath = self.auto_breath,
            "draw"
        );
        Ok(())
    }

    fn start_motion(
        &mut self,
        group: &str,
        index: usize,
        priority: Priority,
    ) -> Result<(), EngineError> {
        let key = MotionKey::new(group, index);
        let duration = *self
            .durations
            .get(&key)
            .ok_or_else(|| EngineError::new(format!("unknown motion {key}")))?;

        if let Some(current) = self.playing_unfinished() {
            if priority < current.priority {
                return Err(EngineError::new(format!(
                    "motion {key} at {priority} cannot replace {} at {}",
                    current.key, current.priority
                )));
            }
        }

        debug!(motion = %key, %priority, ?duration, "motion started");
        self.playing = Some(Playing {
            key,
            priority,
            remaining: duration,
        });
        Ok(())
    }

    fn is_motion_finished(&self) -> bool {
        self.playing_unfinished().is_none()
    }

    fn set_expression(&mut self, id: &str) -> Result<(), EngineError> {
        if !self.expressions.contains(id) {
            return Err(EngineError::new(format!("unknown expression {id}")));
        }
        self.expression = Some(id.to_string());
        Ok(())
    }

    fn hit_test(&self, area_id: &str, x: f32, y: f32) -> bool {
        self.bands
            .get(area_id)
            .is_some_and(|band| band.contains(x, y))
    }

    fn set_dragging(&mut self, x: f32, y: f32) {
        self.drag = (x, y);
    }

    fn set_lip_sync(&mut self, value: f32) {
        self.lip_sync = value;
    }

    fn set_auto_blink(&mut self, enabled: bool) {
        self.auto_blink = enabled;
    }

    fn set_auto_breath(&mut self, enabled: bool) {
        self.auto_breath = enabled;
    }

    fn release(&mut self) {
        self.released = true;
        self.bound.clear();
        self.playing = None;
    }
}
