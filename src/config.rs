use crate::format::{OutputFormat, Resolution};
use crate::paths::AppPaths;
use crate::store;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const MAX_CONCURRENCY_LIMIT: usize = 8;

const TITLE_TEMPLATE: &str = "%(title)s.%(ext)s";
const TITLE_ID_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub default_format: String,
    pub default_resolution: String,
    pub theme: String,
    pub download_path: String,
    /// Naming scheme: plain title, or title followed by the video id.
    pub use_title_template: bool,
    /// Netscape cookie file handed to yt-dlp; empty means none.
    pub cookies_path: String,
    pub max_concurrency: usize,
    pub show_toasts: bool,
    pub debug: bool,
    pub embed_thumbnail: bool,
    /// Keys this version does not know about, kept so a save does not drop them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
    /// File values of the wrong type, with the default used in their place.
    #[serde(skip)]
    retained: BTreeMap<String, (Value, Value)>,
}

impl Settings {
    pub fn defaults_for(paths: &AppPaths) -> Self {
        Self {
            default_format: OutputFormat::Mp4.as_str().to_string(),
            default_resolution: Resolution::Best.label(),
            theme: "dark".to_string(),
            download_path: paths.default_download_dir().to_string_lossy().to_string(),
            use_title_template: true,
            cookies_path: String::new(),
            max_concurrency: 1,
            show_toasts: true,
            debug: false,
            embed_thumbnail: true,
            extra: BTreeMap::new(),
            retained: BTreeMap::new(),
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        OutputFormat::parse(&self.default_format).unwrap_or_default()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::parse(&self.default_resolution).unwrap_or_default()
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.download_path)
    }

    pub fn cookies_file(&self) -> Option<PathBuf> {
        let trimmed = self.cookies_path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }

    pub fn filename_template(&self) -> &'static str {
        if self.use_title_template {
            TITLE_TEMPLATE
        } else {
            TITLE_ID_TEMPLATE
        }
    }

    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT)
    }
}

/// A missing file is created with the defaults.
pub fn load_settings(paths: &AppPaths) -> Settings {
    let defaults = Settings::defaults_for(paths);
    let path = paths.settings_path();

    if !path.exists() {
        store::save_json(&path, &defaults);
        return defaults;
    }

    let loaded: Value = store::read_json_or(&path, Value::Null);
    let Value::Object(loaded) = loaded else {
        log::warn!("settings at {} are not a JSON object; using defaults", path.display());
        return defaults;
    };

    match merge_with_defaults(loaded, &defaults) {
        Some(settings) => settings,
        None => defaults,
    }
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> bool {
    let mut value = match serde_json::to_value(settings) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return false,
        Err(err) => {
            log::error!("failed to encode settings: {err}");
            return false;
        }
    };
    // A value the file had is written back unless it was changed since load.
    for (key, (raw, substituted)) in &settings.retained {
        if value.get(key) == Some(substituted) {
            value.insert(key.clone(), raw.clone());
        }
    }
    store::save_json(&paths.settings_path(), &Value::Object(value))
}

fn merge_with_defaults(mut loaded: Map<String, Value>, defaults: &Settings) -> Option<Settings> {
    let default_map = match serde_json::to_value(defaults) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };

    let mut retained = BTreeMap::new();
    for (key, default_value) in default_map {
        match loaded.get(&key) {
            None => {
                loaded.insert(key, default_value);
            }
            Some(present) if !same_json_kind(present, &default_value) => {
                if let Some(coerced) = coerce(present, &default_value) {
                    loaded.insert(key, coerced);
                    continue;
                }
                log::warn!("settings key {key} has an unexpected type; using its default");
                retained.insert(key.clone(), (present.clone(), default_value.clone()));
                loaded.insert(key, default_value);
            }
            Some(_) => {}
        }
    }

    match serde_json::from_value::<Settings>(Value::Object(loaded)) {
        Ok(mut settings) => {
            settings.retained = retained;
            Some(settings)
        }
        Err(err) => {
            log::warn!("failed to decode merged settings: {err}");
            None
        }
    }
}

/// Reads `"4"` as a number and `"true"` as a bool where the key expects one.
fn coerce(present: &Value, default_value: &Value) -> Option<Value> {
    let text = present.as_str()?.trim();
    match default_value {
        Value::Number(n) if n.is_u64() => text.parse::<u64>().ok().map(Value::from),
        Value::Bool(_) => text.parse::<bool>().ok().map(Value::Bool),
        _ => None,
    }
}

fn same_json_kind(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.is_u64() == y.is_u64(),
        _ => std::mem::discriminant(a) == std::mem::discriminant(b),
    }
}
