//! In-memory engine double and model fixtures for the stage tests.
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use glam::Mat4;
use image::{Rgba, RgbaImage};
use modelpack::{ModelAsset, MotionKey};
use sequencer::Priority;
use settings::StageSettings;

use crate::engine::{EngineError, EngineModel, RenderEngine, TextureId};

#[derive(Debug, Default)]
pub(crate) struct EngineLog {
    pub events: Vec<String>,
    pub initializations: usize,
    pub view_resources_released: usize,
    pub viewport: Option<(u32, u32)>,
    pub textures_created: Vec<TextureId>,
    pub textures_deleted: Vec<TextureId>,
    pub model_loads: Vec<PathBuf>,
    pub models_released: usize,
    pub binds: Vec<(usize, TextureId)>,
    pub motions: Vec<(String, usize, Priority)>,
    pub expressions: Vec<String>,
    pub draws: usize,
    pub last_mvp: Option<Mat4>,
    pub dragging: Vec<(f32, f32)>,
    pub lip_sync: Option<f32>,
    pub auto_blink: Option<bool>,
    pub auto_breath: Option<bool>,
    pub threads: HashSet<ThreadId>,
    pub disposed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct EngineControls {
    pub playing: bool,
    pub fail_initialize: bool,
    pub fail_renderer: bool,
    pub fail_draw: bool,
    pub fail_bind_slots: HashSet<usize>,
    pub panic_on_expression: Option<String>,
    pub head_hit: bool,
    pub body_hit: bool,
}

/// Shared view into what a [`RecordingEngine`] was asked to do, plus knobs
/// that make it misbehave.
#[derive(Clone, Debug, Default)]
pub(crate) struct EngineProbe {
    log: Arc<Mutex<EngineLog>>,
    controls: Arc<Mutex<EngineControls>>,
}

impl EngineProbe {
    pub(crate) fn log(&self) -> MutexGuard<'_, EngineLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn controls(&self) -> MutexGuard<'_, EngineControls> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn finish_motion(&self) {
        self.controls().playing = false;
    }

    fn record(&self, event: &str) -> MutexGuard<'_, EngineLog> {
        let mut log = self.log();
        log.threads.insert(thread::current().id());
        log.events.push(event.to_string());
        log
    }
}

pub(crate) struct RecordingEngine {
    probe: EngineProbe,
    next_texture: u32,
}

impl RecordingEngine {
    pub(crate) fn new(probe: EngineProbe) -> Self {
        Self {
            probe,
            next_texture: 1,
        }
    }
}

impl RenderEngine for RecordingEngine {
    fn initialize(&mut self) -> Result<(), EngineError> {
        if self.probe.controls().fail_initialize {
            return Err(EngineError::new("no usable context"));
        }
        self.probe.record("engine.initialize").initializations += 1;
        Ok(())
    }

    fn create_view_resources(&mut self) -> Result<(), EngineError> {
        self.probe.record("view.create");
        Ok(())
    }

    fn release_view_resources(&mut self) {
        self.probe.record("view.release").view_resources_released += 1;
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.probe.record("viewport").viewport = Some((width, height));
    }

    fn create_texture(&mut self, _image: &RgbaImage) -> Result<TextureId, EngineError> {
        let texture = TextureId(self.next_texture);
        self.next_texture += 1;
        self.probe.record("texture.create").textures_created.push(texture);
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.probe.record("texture.delete").textures_deleted.push(texture);
    }

    fn load_model(&mut self, asset: &ModelAsset) -> Result<Box<dyn EngineModel>, EngineError> {
        self.probe
            .record("model.load")
            .model_loads
            .push(asset.manifest_path.clone());
        Ok(Box::new(RecordingModel {
            probe: self.probe.clone(),
            motions: asset.motions.keys().cloned().collect(),
            expressions: asset.expressions.keys().cloned().collect(),
            renderer: false,
        }))
    }

    fn dispose(&mut self) {
        self.probe.record("engine.dispose").disposed = true;
    }
}

struct RecordingModel {
    probe: EngineProbe,
    motions: BTreeSet<MotionKey>,
    expressions: BTreeSet<String>,
    renderer: bool,
}

impl EngineModel for RecordingModel {
    fn create_renderer(&mut self) -> Result<(), EngineError> {
        if self.probe.controls().fail_renderer {
            return Err(EngineError::new("renderer creation refused"));
        }
        self.probe.record("model.renderer");
        self.renderer = true;
        Ok(())
    }

    fn bind_texture(&mut self, slot: usize, texture: TextureId) -> Result<(), EngineError> {
        if !self.renderer {
            return Err(EngineError::new("bind before renderer"));
        }
        if self.probe.controls().fail_bind_slots.contains(&slot) {
            return Err(EngineError::new(format!("slot {slot} rejected")));
        }
        self.probe.record("model.bind").binds.push((slot, texture));
        Ok(())
    }

    fn canvas_width(&self) -> f32 {
        2.0
    }

    fn update(&mut self, _delta: Duration) {}

    fn draw(&mut self, mvp: &Mat4) -> Result<(), EngineError> {
        if self.probe.controls().fail_draw {
            return Err(EngineError::new("draw refused"));
        }
        let mut log = self.probe.log();
        log.threads.insert(thread::current().id());
        log.draws += 1;
        log.last_mvp = Some(*mvp);
        Ok(())
    }

    fn start_motion(
        &mut self,
        group: &str,
        index: usize,
        priority: Priority,
    ) -> Result<(), EngineError> {
        if !self.motions.contains(&MotionKey::new(group, index)) {
            return Err(EngineError::new(format!("unknown motion {group}_{index}")));
        }
        self.probe.controls().playing = true;
        self.probe
            .record("model.motion")
            .motions
            .push((group.to_string(), index, priority));
        Ok(())
    }

    fn is_motion_finished(&self) -> bool {
        !self.probe.controls().playing
    }

    fn set_expression(&mut self, id: &str) -> Result<(), EngineError> {
        let panics = self.probe.controls().panic_on_expression.as_deref() == Some(id);
        if panics {
            panic!("expression {id} crashed the engine");
        }
        if !self.expressions.contains(id) {
            return Err(EngineError::new(format!("unknown expression {id}")));
        }
        self.probe
            .record("model.expression")
            .expressions
            .push(id.to_string());
        Ok(())
    }

    fn hit_test(&self, area_id: &str, _x: f32, _y: f32) -> bool {
        let controls = self.probe.controls();
        (controls.head_hit && area_id == "HitAreaHead")
            || (controls.body_hit && area_id == "HitAreaBody")
    }

    fn set_dragging(&mut self, x: f32, y: f32) {
        self.probe.record("model.drag").dragging.push((x, y));
    }

    fn set_lip_sync(&mut self, value: f32) {
        self.probe.log().lip_sync = Some(value);
    }

    fn set_auto_blink(&mut self, enabled: bool) {
        self.probe.log().auto_blink = Some(enabled);
    }

    fn set_auto_breath(&mut self, enabled: bool) {
        self.probe.log().auto_breath = Some(enabled);
    }

    fn release(&mut self) {
        self.probe.record("model.release").models_released += 1;
    }
}

pub(crate) fn write_png(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create texture dir");
    }
    RgbaImage::from_pixel(2, 2, Rgba([200, 120, 80, 255]))
        .save(&path)
        .expect("write png");
    path
}

fn write_file(dir: &Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture dir");
    }
    fs::write(path, contents).expect("write fixture");
}

/// Writes `<name>.model3.json` into `dir`: two textures shared by every
/// fixture in the same directory, expressions `e1`..`e3`, six `TapBody`
/// motions, one `Idle` motion and `Head`/`Body` hit areas.
pub(crate) fn write_model(dir: &Path, name: &str) -> PathBuf {
    write_png(dir, "textures/t0.png");
    write_png(dir, "textures/t1.png");
    write_file(dir, &format!("{name}.moc3"), "MOC3");
    for id in ["e1", "e2", "e3"] {
        write_file(dir, &format!("expressions/{id}.exp3.json"), r#"{"Type": "Live2D Expression"}"#);
    }
    for index in 0..6 {
        write_file(
            dir,
            &format!("motions/tap_{index}.motion3.json"),
            r#"{"Version": 3, "Meta": {"Duration": 1.0, "Fps": 30.0}}"#,
        );
    }
    write_file(
        dir,
        "motions/idle.motion3.json",
        r#"{"Version": 3, "Meta": {"Duration": 3.0, "Loop": true}}"#,
    );

    let taps: Vec<String> = (0..6)
        .map(|index| format!(r#"{{"File": "motions/tap_{index}.motion3.json"}}"#))
        .collect();
    let description = format!(
        r#"{{
            "Version": 3,
            "FileReferences": {{
                "Moc": "{name}.moc3",
                "Textures": ["textures/t0.png", "textures/t1.png"],
                "Expressions": [
                    {{"Name": "e1", "File": "expressions/e1.exp3.json"}},
                    {{"Name": "e2", "File": "expressions/e2.exp3.json"}},
                    {{"Name": "e3", "File": "expressions/e3.exp3.json"}}
                ],
                "Motions": {{
                    "Idle": [{{"File": "motions/idle.motion3.json"}}],
                    "TapBody": [{}]
                }}
            }},
            "HitAreas": [
                {{"Id": "HitAreaHead", "Name": "Head"}},
                {{"Id": "HitAreaBody", "Name": "Body"}}
            ]
        }}"#,
        taps.join(", ")
    );
    let path = dir.join(format!("{name}.model3.json"));
    fs::write(&path, description).expect("write description");
    path
}

/// Defaults with idle motions off and a fixed seed.
pub(crate) fn test_settings() -> StageSettings {
    let mut settings = StageSettings::default();
    settings.animation.idle_group = None;
    settings.animation.seed = Some(1);
    settings
}
