//! YAML configuration and live reloading.

use crate::display::ContextConfig;
use crate::effects::{Effect, EffectControls, DEFAULT_CAPTURE_DELAY, DEFAULT_MATTE_THRESHOLD};
use crate::shader::ShaderSource;
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use tracing::{error, info, warn};

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub context: ContextConfig,
    pub effects: EffectsConfig,
}

/// Effect properties. Everything here can change while streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub effect: Effect,
    pub mirror: bool,
    /// Replacement picture for the `background` effect.
    pub background: Option<PathBuf>,
    pub capture_delay_frames: u32,
    pub matte_threshold: f32,
    /// Pass key to shader file. `.wgsl` files hold a fragment body, any
    /// other extension is read as a complete GLSL fragment shader.
    pub shader_overrides: BTreeMap<String, PathBuf>,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            effect: Effect::default(),
            mirror: false,
            background: None,
            capture_delay_frames: DEFAULT_CAPTURE_DELAY,
            matte_threshold: DEFAULT_MATTE_THRESHOLD,
            shader_overrides: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config file {:?}", path))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Reads a shader file, picking the language from its extension.
pub fn load_shader(path: &Path) -> Result<ShaderSource> {
    info!("Loading shader from {:?}", path);
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read shader {:?}", path))?;
    Ok(ShaderSource::from_path(path, text))
}

/// Effect changes the caller has to carry out itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    /// Background picture to load at the stream size and hand to
    /// [`EffectControls::set_background`].
    pub background: Option<PathBuf>,
    pub visible: Option<bool>,
}

/// Pushes the differences between `old` and `new` into `controls`.
///
/// With no `old` config every setting is applied. Shader files that fail to
/// load are logged and skipped.
pub fn apply_config_changes(
    old: Option<&Config>,
    new: &Config,
    controls: &EffectControls,
) -> PendingChanges {
    let fresh = EffectsConfig::default();
    let prev = old.map(|c| &c.effects).unwrap_or(&fresh);
    let next = &new.effects;
    let everything = old.is_none();

    if everything || prev.effect != next.effect {
        controls.set_effect(next.effect);
    }
    if everything || prev.mirror != next.mirror {
        info!("Mirror: {}", next.mirror);
        controls.set_mirrored(next.mirror);
    }
    if everything || prev.matte_threshold != next.matte_threshold {
        controls.set_matte_threshold(next.matte_threshold);
    }
    if everything || prev.capture_delay_frames != next.capture_delay_frames {
        controls.set_capture_delay(next.capture_delay_frames);
    }

    for (key, path) in &next.shader_overrides {
        if !everything && prev.shader_overrides.get(key) == Some(path) {
            continue;
        }
        match load_shader(path) {
            Ok(source) => controls.set_shader_override(key, source),
            Err(e) => error!("Shader override `{}`: {:#}", key, e),
        }
    }
    for key in prev.shader_overrides.keys() {
        if !next.shader_overrides.contains_key(key) {
            info!("Dropping shader override `{}`", key);
            controls.clear_shader_override(key);
        }
    }

    let mut pending = PendingChanges::default();
    if next.background.is_some() && (everything || prev.background != next.background) {
        pending.background = next.background.clone();
    }
    if old.is_some_and(|o| o.context.visible != new.context.visible) {
        pending.visible = Some(new.context.visible);
    }
    pending
}

/// Manages configuration file watching and reloading.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    current: Option<Config>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Option<Self> {
        let (tx, rx) = channel();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("Failed to create config watcher: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!("Failed to watch config file {:?}: {}", path, e);
            return None;
        }
        info!("Watching config file {:?} for changes", path);

        let current = Config::load(&path).ok();
        Some(Self {
            path,
            _watcher: watcher,
            rx,
            current,
        })
    }

    pub fn current(&self) -> Option<&Config> {
        self.current.as_ref()
    }

    /// Drains file events. Returns `(old, new)` when the file changed and
    /// still parses.
    pub fn check_for_changes(&mut self) -> Option<(Option<Config>, Config)> {
        let mut needs_reload = false;
        while let Ok(res) = self.rx.try_recv() {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                ) {
                    needs_reload = true;
                }
            }
        }
        if !needs_reload {
            return None;
        }

        info!("Config file changed, reloading");
        match Config::load(&self.path) {
            Ok(config) if self.current.as_ref() == Some(&config) => None,
            Ok(config) => {
                let old = self.current.replace(config.clone());
                Some((old, config))
            }
            Err(e) => {
                error!("{:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("morpheus-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_yaml("effects:\n  effect: twirl\n").unwrap();
        assert_eq!(config.effects.effect, Effect::Twirl);
        assert!(!config.effects.mirror);
        assert_eq!(config.effects.capture_delay_frames, DEFAULT_CAPTURE_DELAY);
        assert_eq!(config.context, ContextConfig::default());
    }

    #[test]
    fn test_unknown_effect_rejected() {
        assert!(Config::from_yaml("effects:\n  effect: vortex\n").is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut config = Config::default();
        config.effects.effect = Effect::Glow;
        config.context.width = 320;
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_apply_changes() {
        let shader = temp_path("override.wgsl");
        fs::write(&shader, "@fragment fn fs_main() {}").unwrap();

        let controls = EffectControls::new();
        let mut first = Config::default();
        first.effects.effect = Effect::Heat;
        first.effects.background = Some(PathBuf::from("bg.png"));
        let pending = apply_config_changes(None, &first, &controls);
        assert_eq!(controls.effect(), Effect::Heat);
        assert_eq!(pending.background, Some(PathBuf::from("bg.png")));

        let mut second = first.clone();
        second.effects.mirror = true;
        second.context.visible = true;
        second
            .effects
            .shader_overrides
            .insert("sobel".to_string(), shader.clone());
        let pending = apply_config_changes(Some(&first), &second, &controls);
        assert!(controls.is_mirrored());
        assert_eq!(pending.background, None);
        assert_eq!(pending.visible, Some(true));

        fs::remove_file(&shader).unwrap();
    }

    #[test]
    fn test_watcher_starts_quiet() {
        let path = temp_path("watch.yaml");
        fs::write(&path, "effects:\n  effect: bulge\n").unwrap();
        if let Some(mut watcher) = ConfigWatcher::new(path.clone()) {
            assert_eq!(watcher.current().map(|c| c.effects.effect), Some(Effect::Bulge));
            assert!(watcher.check_for_changes().is_none());
        }
        fs::remove_file(&path).unwrap();
    }
}
