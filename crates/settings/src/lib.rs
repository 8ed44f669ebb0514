use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Motion priority understood by the engine's motion resolver. A request only
/// replaces the playing motion when its priority is at least as high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    None,
    Idle,
    #[default]
    Normal,
    Force,
}

impl Priority {
    pub fn level(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Idle => 1,
            Self::Normal => 2,
            Self::Force => 3,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::None),
            1 => Some(Self::Idle),
            2 => Some(Self::Normal),
            3 => Some(Self::Force),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Idle => "idle",
            Self::Normal => "normal",
            Self::Force => "force",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Str(String),
            Num(i64),
        }

        match Helper::deserialize(deserializer)? {
            Helper::Str(raw) => parse_priority(&raw).map_err(de::Error::custom),
            Helper::Num(value) => u8::try_from(value)
                .ok()
                .and_then(Priority::from_level)
                .ok_or_else(|| {
                    de::Error::custom(format!("priority level {value} out of range 0-3"))
                }),
        }
    }
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "none" | "0" => Ok(Priority::None),
        "idle" | "1" => Ok(Priority::Idle),
        "normal" | "2" => Ok(Priority::Normal),
        "force" | "forced" | "3" => Ok(Priority::Force),
        other => Err(format!("invalid priority '{other}'")),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSettings {
    pub version: u32,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub animation: AnimationSettings,
    #[serde(default)]
    pub view: ViewSettings,
    #[serde(default)]
    pub textures: TextureSettings,
    #[serde(default)]
    pub hit_areas: HitAreaSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderSettings {
    #[serde(default = "default_fps")]
    pub fps: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnimationSettings {
    #[serde(default = "default_motion_capacity")]
    pub motion_queue_capacity: usize,
    #[serde(default = "default_expression_capacity")]
    pub expression_queue_capacity: usize,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(default = "default_motion_priority")]
    pub motion_priority: Priority,
    #[serde(default)]
    pub replay_priority: Priority,
    #[serde(default = "default_idle_group")]
    pub idle_group: Option<String>,
    #[serde(default = "default_tap_group")]
    pub tap_group: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViewSettings {
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    #[serde(default = "default_max_scale")]
    pub max_scale: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextureSettings {
    #[serde(default = "default_bind_backoff")]
    pub max_bind_backoff_frames: u32,
}

/// Names of the hit areas declared in the model description that trigger the
/// built-in tap reactions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HitAreaSettings {
    #[serde(default = "default_head_area")]
    pub head: String,
    #[serde(default = "default_body_area")]
    pub body: String,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            version: 1,
            render: RenderSettings::default(),
            animation: AnimationSettings::default(),
            view: ViewSettings::default(),
            textures: TextureSettings::default(),
            hit_areas: HitAreaSettings::default(),
        }
    }
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { fps: default_fps() }
    }
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            motion_queue_capacity: default_motion_capacity(),
            expression_queue_capacity: default_expression_capacity(),
            poll_interval: default_poll_interval(),
            motion_priority: default_motion_priority(),
            replay_priority: Priority::Normal,
            idle_group: default_idle_group(),
            tap_group: default_tap_group(),
            seed: None,
        }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
        }
    }
}

impl Default for TextureSettings {
    fn default() -> Self {
        Self {
            max_bind_backoff_frames: default_bind_backoff(),
        }
    }
}

impl Default for HitAreaSettings {
    fn default() -> Self {
        Self {
            head: default_head_area(),
            body: default_body_area(),
        }
    }
}

fn default_fps() -> Option<f32> {
    Some(60.0)
}

fn default_motion_capacity() -> usize {
    3
}

fn default_expression_capacity() -> usize {
    2
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(20)
}

fn default_motion_priority() -> Priority {
    Priority::Force
}

fn default_idle_group() -> Option<String> {
    Some("Idle".into())
}

fn default_tap_group() -> String {
    "TapBody".into()
}

fn default_min_scale() -> f32 {
    0.1
}

fn default_max_scale() -> f32 {
    10.0
}

fn default_bind_backoff() -> u32 {
    64
}

fn default_head_area() -> String {
    "Head".into()
}

fn default_body_area() -> String {
    "Body".into()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl StageSettings {
    pub fn from_toml_str(input: &str) -> Result<Self, SettingsError> {
        let raw: StageSettings = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Frame interval implied by `render.fps`; `None` renders as fast as the
    /// command queue wakes the render thread.
    pub fn frame_interval(&self) -> Option<Duration> {
        self.render
            .fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f32(1.0 / fps))
    }

    pub fn clamp_scale(&self, scale: f32) -> f32 {
        scale.clamp(self.view.min_scale, self.view.max_scale)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.version != 1 {
            return Err(SettingsError::Invalid(format!(
                "unsupported settings version {}; expected 1",
                self.version
            )));
        }

        if let Some(fps) = self.render.fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(SettingsError::Invalid("render.fps must be > 0".into()));
            }
        }

        let animation = &self.animation;
        if animation.motion_queue_capacity == 0 {
            return Err(SettingsError::Invalid(
                "animation.motion_queue_capacity must be at least 1".into(),
            ));
        }
        if animation.expression_queue_capacity == 0 {
            return Err(SettingsError::Invalid(
                "animation.expression_queue_capacity must be at least 1".into(),
            ));
        }
        if animation.poll_interval.is_zero() {
            return Err(SettingsError::Invalid(
                "animation.poll_interval must be greater than zero".into(),
            ));
        }
        if let Some(group) = &animation.idle_group {
            if group.trim().is_empty() {
                return Err(SettingsError::Invalid(
                    "animation.idle_group may not be empty; omit it to disable idle motions"
                        .into(),
                ));
            }
        }
        if animation.tap_group.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "animation.tap_group may not be empty".into(),
            ));
        }

        let view = &self.view;
        if !(view.min_scale.is_finite() && view.min_scale > 0.0) {
            return Err(SettingsError::Invalid("view.min_scale must be > 0".into()));
        }
        if !view.max_scale.is_finite() || view.max_scale < view.min_scale {
            return Err(SettingsError::Invalid(format!(
                "view.max_scale ({}) must be >= view.min_scale ({})",
                view.max_scale, view.min_scale
            )));
        }

        if self.textures.max_bind_backoff_frames == 0 {
            return Err(SettingsError::Invalid(
                "textures.max_bind_backoff_frames must be at least 1".into(),
            ));
        }

        for (key, name) in [("head", &self.hit_areas.head), ("body", &self.hit_areas.body)] {
            if name.trim().is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "hit_areas.{key} may not be empty"
                )));
            }
        }

        Ok(())
    }
}
