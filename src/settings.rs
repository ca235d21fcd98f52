//! # Settings Store
//!
//! Schema-validated JSON configuration. The document is grouped (`serial`,
//! `command`, `logging`, `ui`, `parser`, `macro`) and versioned; loading
//! never fails:
//!
//! - An unreadable or non-JSON file is preserved as a `.bak` backup, the
//!   embedded defaults take over, and a reset-on-start flag is raised for
//!   the application to surface once.
//! - A field of the wrong type falls back to its schema default through the
//!   safe-cast helpers rather than failing the whole document.
//! - Documents with an older schema version (including the legacy flat
//!   layout) are migrated in place, preserving user values.
//!
//! Saving writes the typed, normalized form, so load → save → load is
//! idempotent. The data paths only ever read settings; writes happen on the
//! main thread and publish a `settings.changed` delta.

use crate::buffer::{DEFAULT_RING_CAPACITY, DEFAULT_TX_QUEUE_LIMIT};
use crate::bus::{Event, EventBus};
use crate::command::resolve_escapes;
use crate::config::{ParserSelection, PortConfig};
use crate::data_logger::LogFormat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fs, io};
use tracing::{info, warn};

/// Current settings document version.
pub const SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub last_port: String,
    pub default_baudrate: u32,
    pub auto_scan_interval_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            last_port: String::new(),
            default_baudrate: 115_200,
            auto_scan_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSettings {
    /// Escape sequences (`\r`, `\n`, ...) are honored when applied.
    pub prefix: String,
    pub suffix: String,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            suffix: "\\r\\n".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub log_dir: PathBuf,
    pub max_file_bytes: u64,
    pub keep_files: usize,
    /// One of `raw`, `hex`, `pcap`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            max_file_bytes: 10 * 1024 * 1024,
            keep_files: 5,
            format: "raw".to_string(),
        }
    }
}

impl LoggingSettings {
    pub fn log_format(&self) -> LogFormat {
        match self.format.as_str() {
            "hex" => LogFormat::HexDump,
            "pcap" => LogFormat::Pcap,
            _ => LogFormat::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontSettings {
    pub family: String,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontsSettings {
    pub proportional: FontSettings,
    pub fixed: FontSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiSettings {
    pub theme: String,
    pub font: FontsSettings,
    pub log_max_lines: u64,
    pub hex_mode_default: bool,
    pub right_panel_visible: bool,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            font: FontsSettings {
                proportional: FontSettings {
                    family: "Sans".to_string(),
                    size: 10,
                },
                fixed: FontSettings {
                    family: "Monospace".to_string(),
                    size: 10,
                },
            },
            log_max_lines: 10_000,
            hex_mode_default: false,
            right_panel_visible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtColorSettings {
    pub ok: String,
    pub error: String,
    pub urc: String,
    pub prompt: String,
}

impl Default for AtColorSettings {
    fn default() -> Self {
        Self {
            ok: "#4caf50".to_string(),
            error: "#f44336".to_string(),
            urc: "#2196f3".to_string(),
            prompt: "#ff9800".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectorSettings {
    pub buffer_size: u64,
    pub real_time_tracking: bool,
    pub auto_scroll: bool,
}

impl Default for InspectorSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_RING_CAPACITY as u64,
            real_time_tracking: true,
            auto_scroll: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserSettings {
    /// One of `auto`, `at`, `delimiter`, `fixed`, `raw`.
    #[serde(rename = "type")]
    pub parser_type: String,
    /// Delimiter byte-strings; escape sequences honored.
    pub delimiters: Vec<String>,
    pub fixed_length: u64,
    pub at_colors: AtColorSettings,
    pub inspector: InspectorSettings,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            parser_type: "auto".to_string(),
            delimiters: vec!["\\r\\n".to_string()],
            fixed_length: 16,
            at_colors: AtColorSettings::default(),
            inspector: InspectorSettings::default(),
        }
    }
}

impl ParserSettings {
    /// Resolve the configured parser. `auto` resolves to the AT parser.
    pub fn selection(&self) -> ParserSelection {
        match self.parser_type.as_str() {
            "at" | "auto" => ParserSelection::At,
            "delimiter" => ParserSelection::Delimiter {
                delimiters: self
                    .delimiters
                    .iter()
                    .map(|d| resolve_escapes(d).into_bytes())
                    .filter(|d| !d.is_empty())
                    .collect(),
            },
            "fixed" => ParserSelection::FixedLength {
                length: (self.fixed_length as usize).clamp(1, 4096),
            },
            "hex" => ParserSelection::Hex,
            _ => ParserSelection::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSettings {
    pub stop_on_error: bool,
    pub broadcast_default: bool,
    /// -1 repeats until stopped.
    pub repeat_count: i64,
    pub per_step_delay_ms: u64,
}

impl Default for MacroSettings {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            broadcast_default: false,
            repeat_count: 1,
            per_step_delay_ms: 0,
        }
    }
}

/// The whole settings document in typed form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    pub schema_version: SchemaVersion,
    pub serial: SerialSettings,
    pub command: CommandSettings,
    pub logging: LoggingSettings,
    pub ui: UiSettings,
    pub parser: ParserSettings,
    #[serde(rename = "macro")]
    pub macros: MacroSettings,
}

/// Newtype so `Default` yields the current version, not zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion(pub u64);

impl Default for SchemaVersion {
    fn default() -> Self {
        SchemaVersion(SCHEMA_VERSION)
    }
}

impl Settings {
    /// Build a port configuration seeded from these settings.
    pub fn port_config(&self, port_id: &str) -> PortConfig {
        let mut config = PortConfig::new(port_id);
        config.baud_rate = self.serial.default_baudrate;
        config.parser = self.parser.selection();
        config.tx_queue_limit = DEFAULT_TX_QUEUE_LIMIT;
        config.rx_ring_capacity = (self.parser.inspector.buffer_size as usize).max(4096);
        config
    }

    /// Safe-cast construction from a raw document: every field of the wrong
    /// type becomes its schema default instead of failing the load.
    fn from_value(doc: &Value) -> Self {
        let d = Settings::default();

        let serial = doc.get("serial");
        let command = doc.get("command");
        let logging = doc.get("logging");
        let ui = doc.get("ui");
        let parser = doc.get("parser");
        let macros = doc.get("macro");

        Settings {
            schema_version: SchemaVersion(get_u64(doc.get("schema_version"), SCHEMA_VERSION)),
            serial: SerialSettings {
                last_port: get_string(field(serial, "last_port"), &d.serial.last_port),
                default_baudrate: get_u64(
                    field(serial, "default_baudrate"),
                    d.serial.default_baudrate as u64,
                )
                .max(50) as u32,
                auto_scan_interval_ms: get_u64(
                    field(serial, "auto_scan_interval_ms"),
                    d.serial.auto_scan_interval_ms,
                ),
            },
            command: CommandSettings {
                prefix: get_string(field(command, "prefix"), &d.command.prefix),
                suffix: get_string(field(command, "suffix"), &d.command.suffix),
            },
            logging: LoggingSettings {
                log_dir: PathBuf::from(get_string(
                    field(logging, "log_dir"),
                    &d.logging.log_dir.to_string_lossy(),
                )),
                max_file_bytes: get_u64(
                    field(logging, "max_file_bytes"),
                    d.logging.max_file_bytes,
                ),
                keep_files: get_u64(field(logging, "keep_files"), d.logging.keep_files as u64)
                    as usize,
                format: get_string(field(logging, "format"), &d.logging.format),
            },
            ui: UiSettings {
                theme: get_string(field(ui, "theme"), &d.ui.theme),
                font: FontsSettings {
                    proportional: font_from(
                        field(field(ui, "font"), "proportional"),
                        &d.ui.font.proportional,
                    ),
                    fixed: font_from(field(field(ui, "font"), "fixed"), &d.ui.font.fixed),
                },
                log_max_lines: get_u64(field(ui, "log_max_lines"), d.ui.log_max_lines),
                hex_mode_default: get_bool(field(ui, "hex_mode_default"), d.ui.hex_mode_default),
                right_panel_visible: get_bool(
                    field(ui, "right_panel_visible"),
                    d.ui.right_panel_visible,
                ),
            },
            parser: ParserSettings {
                parser_type: get_string(field(parser, "type"), &d.parser.parser_type),
                delimiters: get_string_list(field(parser, "delimiters"), &d.parser.delimiters),
                fixed_length: get_u64(field(parser, "fixed_length"), d.parser.fixed_length)
                    .clamp(1, 4096),
                at_colors: AtColorSettings {
                    ok: get_string(
                        field(field(parser, "at_colors"), "ok"),
                        &d.parser.at_colors.ok,
                    ),
                    error: get_string(
                        field(field(parser, "at_colors"), "error"),
                        &d.parser.at_colors.error,
                    ),
                    urc: get_string(
                        field(field(parser, "at_colors"), "urc"),
                        &d.parser.at_colors.urc,
                    ),
                    prompt: get_string(
                        field(field(parser, "at_colors"), "prompt"),
                        &d.parser.at_colors.prompt,
                    ),
                },
                inspector: InspectorSettings {
                    buffer_size: get_u64(
                        field(field(parser, "inspector"), "buffer_size"),
                        d.parser.inspector.buffer_size,
                    ),
                    real_time_tracking: get_bool(
                        field(field(parser, "inspector"), "real_time_tracking"),
                        d.parser.inspector.real_time_tracking,
                    ),
                    auto_scroll: get_bool(
                        field(field(parser, "inspector"), "auto_scroll"),
                        d.parser.inspector.auto_scroll,
                    ),
                },
            },
            macros: MacroSettings {
                stop_on_error: get_bool(field(macros, "stop_on_error"), d.macros.stop_on_error),
                broadcast_default: get_bool(
                    field(macros, "broadcast_default"),
                    d.macros.broadcast_default,
                ),
                repeat_count: get_i64(field(macros, "repeat_count"), d.macros.repeat_count),
                per_step_delay_ms: get_u64(
                    field(macros, "per_step_delay_ms"),
                    d.macros.per_step_delay_ms,
                ),
            },
        }
    }
}

// --- safe-cast helpers ----------------------------------------------------

fn field<'a>(value: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    value.and_then(|v| v.get(key))
}

fn get_string(value: Option<&Value>, default: &str) -> String {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn get_u64(value: Option<&Value>, default: u64) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(default)
}

fn get_i64(value: Option<&Value>, default: i64) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(default)
}

fn get_bool(value: Option<&Value>, default: bool) -> bool {
    value.and_then(Value::as_bool).unwrap_or(default)
}

fn get_string_list(value: Option<&Value>, default: &[String]) -> Vec<String> {
    match value.and_then(Value::as_array) {
        Some(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => default.to_vec(),
    }
}

fn font_from(value: Option<&Value>, default: &FontSettings) -> FontSettings {
    FontSettings {
        family: get_string(field(value, "family"), &default.family),
        size: get_u64(field(value, "size"), default.size as u64) as u32,
    }
}

// --- migration ------------------------------------------------------------

/// Legacy flat keys (schema v1) and the group each moved into.
const LEGACY_MOVES: &[(&str, &str, &str)] = &[
    ("last_port", "serial", "last_port"),
    ("default_baudrate", "serial", "default_baudrate"),
    ("auto_scan_interval_ms", "serial", "auto_scan_interval_ms"),
    ("prefix", "command", "prefix"),
    ("suffix", "command", "suffix"),
    ("log_dir", "logging", "log_dir"),
    ("log_format", "logging", "format"),
    ("max_file_bytes", "logging", "max_file_bytes"),
    ("keep_files", "logging", "keep_files"),
    ("theme", "ui", "theme"),
    ("hex_mode_default", "ui", "hex_mode_default"),
    ("parser_type", "parser", "type"),
    ("fixed_length", "parser", "fixed_length"),
    ("stop_on_error", "macro", "stop_on_error"),
    ("broadcast_default", "macro", "broadcast_default"),
    ("repeat_count", "macro", "repeat_count"),
    ("per_step_delay_ms", "macro", "per_step_delay_ms"),
];

/// Upgrade an older document in place, preserving user values. Returns true
/// when anything changed.
fn migrate(doc: &mut Value) -> bool {
    let version = get_u64(doc.get("schema_version"), 1);
    if version >= SCHEMA_VERSION {
        return false;
    }
    info!(from = version, to = SCHEMA_VERSION, "migrating settings document");

    // v1 → v2: flat keys move into their groups.
    if let Some(root) = doc.as_object_mut() {
        for (legacy, group, key) in LEGACY_MOVES {
            let Some(value) = root.remove(*legacy) else {
                continue;
            };
            let group_obj = root
                .entry(group.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(group_obj) = group_obj.as_object_mut() {
                // A value already present in the new layout wins.
                group_obj.entry(key.to_string()).or_insert(value);
            }
        }
        root.insert(
            "schema_version".to_string(),
            Value::from(SCHEMA_VERSION),
        );
    }
    true
}

// --- store ----------------------------------------------------------------

/// Owner of the on-disk settings document.
pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<Settings>,
    reset_on_start: AtomicBool,
    bus: Option<Arc<EventBus>>,
}

impl SettingsStore {
    /// Platform-conventional settings path
    /// (`<config dir>/serial-fabric/settings.json`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("serial-fabric")
            .join("settings.json")
    }

    /// Load (or fall back to defaults). Never fails: a corrupt file is
    /// preserved as `<path>.bak` and the reset-on-start flag raised.
    pub fn load(path: impl Into<PathBuf>, bus: Option<Arc<EventBus>>) -> Self {
        let path = path.into();
        let mut reset = false;

        let settings = match fs::read_to_string(&path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Settings::default(),
            Err(err) => {
                warn!(path = %path.display(), "settings unreadable, using defaults: {err}");
                reset = true;
                Settings::default()
            }
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(mut doc) if doc.is_object() => {
                    migrate(&mut doc);
                    Settings::from_value(&doc)
                }
                _ => {
                    warn!(path = %path.display(), "settings corrupt, restoring defaults");
                    let backup = path.with_extension("json.bak");
                    if let Err(err) = fs::copy(&path, &backup) {
                        warn!("could not preserve corrupt settings: {err}");
                    }
                    reset = true;
                    Settings::default()
                }
            },
        };

        Self {
            path,
            settings: RwLock::new(settings),
            reset_on_start: AtomicBool::new(reset),
            bus,
        }
    }

    /// True once per occurrence of a defaults restore; the application
    /// surfaces it to the user on startup.
    pub fn reset_on_start(&self) -> bool {
        self.reset_on_start.load(Ordering::Relaxed)
    }

    pub fn get(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the normalized typed form.
    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&*self.settings.read())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, text)
    }

    /// Apply a mutation and publish the changed keys as a
    /// `settings.changed` delta.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) {
        let (before, after) = {
            let mut settings = self.settings.write();
            let before = settings.clone();
            mutate(&mut settings);
            (before, settings.clone())
        };
        if before == after {
            return;
        }
        if let Some(bus) = &self.bus {
            let delta = diff_settings(&before, &after);
            bus.publish_event(&Event::SettingsChanged { delta });
        }
    }
}

/// Flat `group.key → new value` map of every changed leaf.
fn diff_settings(before: &Settings, after: &Settings) -> HashMap<String, Value> {
    let mut old_flat = HashMap::new();
    let mut new_flat = HashMap::new();
    flatten("", &serde_json::to_value(before).unwrap_or_default(), &mut old_flat);
    flatten("", &serde_json::to_value(after).unwrap_or_default(), &mut new_flat);

    new_flat
        .into_iter()
        .filter(|(key, value)| old_flat.get(key) != Some(value))
        .collect()
}

fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults_without_reset_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json"), None);
        assert_eq!(store.get(), Settings::default());
        assert!(!store.reset_on_start());
    }

    #[test]
    fn corrupt_file_is_backed_up_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json at all").unwrap();

        let store = SettingsStore::load(&path, None);
        assert!(store.reset_on_start());
        assert_eq!(store.get(), Settings::default());
        assert!(dir.path().join("settings.json.bak").exists());
    }

    #[test]
    fn wrong_typed_field_falls_back_to_schema_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "schema_version": 2,
                "serial": {"default_baudrate": "fast", "last_port": "/dev/ttyUSB0"},
                "ui": {"log_max_lines": true}
            }"#,
        )
        .unwrap();

        let store = SettingsStore::load(&path, None);
        let settings = store.get();
        assert_eq!(settings.serial.default_baudrate, 115_200);
        assert_eq!(settings.serial.last_port, "/dev/ttyUSB0");
        assert_eq!(settings.ui.log_max_lines, 10_000);
        assert!(!store.reset_on_start());
    }

    #[test]
    fn legacy_flat_document_migrates_into_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "last_port": "COM7",
                "default_baudrate": 9600,
                "prefix": "AT",
                "suffix": "\\r",
                "theme": "light",
                "stop_on_error": true,
                "log_format": "pcap"
            }"#,
        )
        .unwrap();

        let store = SettingsStore::load(&path, None);
        let settings = store.get();
        assert_eq!(settings.schema_version.0, SCHEMA_VERSION);
        assert_eq!(settings.serial.last_port, "COM7");
        assert_eq!(settings.serial.default_baudrate, 9600);
        assert_eq!(settings.command.prefix, "AT");
        assert_eq!(settings.command.suffix, "\\r");
        assert_eq!(settings.ui.theme, "light");
        assert!(settings.macros.stop_on_error);
        assert_eq!(settings.logging.log_format(), LogFormat::Pcap);
    }

    #[test]
    fn load_save_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"last_port": "COM3", "default_baudrate": 57600, "theme": "light"}"#,
        )
        .unwrap();

        let store = SettingsStore::load(&path, None);
        let once = store.get();
        store.save().unwrap();

        let store2 = SettingsStore::load(&path, None);
        let twice = store2.get();
        assert_eq!(once, twice);

        store2.save().unwrap();
        let store3 = SettingsStore::load(&path, None);
        assert_eq!(store3.get(), twice);
    }

    #[test]
    fn update_publishes_changed_keys_only() {
        use parking_lot::Mutex;
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe("settings.changed", move |_, event| {
            if let Event::SettingsChanged { delta } = event {
                *sink.lock() = delta.clone();
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("s.json"), Some(bus));
        store.update(|s| {
            s.ui.theme = "light".to_string();
            s.serial.default_baudrate = 9600;
        });

        let delta = seen.lock().clone();
        assert_eq!(delta.get("ui.theme"), Some(&Value::from("light")));
        assert_eq!(delta.get("serial.default_baudrate"), Some(&Value::from(9600)));
        assert_eq!(delta.len(), 2);
    }

    #[test]
    fn parser_selection_resolves_types() {
        let mut parser = ParserSettings::default();
        parser.parser_type = "fixed".into();
        parser.fixed_length = 32;
        assert_eq!(parser.selection(), ParserSelection::FixedLength { length: 32 });

        parser.parser_type = "delimiter".into();
        parser.delimiters = vec!["\\r\\n".into()];
        assert_eq!(
            parser.selection(),
            ParserSelection::Delimiter {
                delimiters: vec![b"\r\n".to_vec()]
            }
        );

        parser.parser_type = "auto".into();
        assert_eq!(parser.selection(), ParserSelection::At);
    }
}
