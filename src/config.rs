use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct Setting {
    value: String,
    help: &'static str,
}

/// Flat `section.key` settings store.
///
/// Keys are declared by pre-parse hooks together with their defaults, then
/// overwritten by the config file and the command line, then normalized by
/// post-parse hooks. Values are kept as strings; protocols interpret them.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: BTreeMap<String, Setting>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a key with its default. Re-declaring keeps the current value.
    pub fn declare(&mut self, key: &str, default: &str, help: &'static str) {
        self.values.entry(key.to_string()).or_insert(Setting {
            value: default.to_string(),
            help,
        });
    }

    /// Value of `key`, or an empty string when the key was never declared.
    pub fn get(&self, key: &str) -> &str {
        self.values
            .get(key)
            .map(|s| s.value.as_str())
            .unwrap_or("")
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get(key).trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        )
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get(key)
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for setting '{}': {:?}", key, self.get(key)))
    }

    /// Overwrite a declared key. Returns false when the key is unknown.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> bool {
        match self.values.get_mut(key) {
            Some(setting) => {
                setting.value = value.into();
                true
            }
            None => false,
        }
    }

    /// Apply overrides in order; later entries win. Unknown keys are logged
    /// and skipped so an old config file does not stop the bot.
    pub fn apply_overrides<I>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in overrides {
            if !self.set(&key, value) {
                warn!("Ignoring unknown setting: {}", key);
            }
        }
    }

    /// Fill an empty key from `fallback` (trimmed).
    pub fn fallback(&mut self, key: &str, fallback: Option<String>) {
        if !self.get(key).trim().is_empty() {
            return;
        }
        if let Some(value) = fallback {
            let value = value.trim();
            if !value.is_empty() {
                self.set(key, value);
            }
        }
    }

    /// Fill an empty key from an environment variable.
    pub fn fallback_to_env(&mut self, key: &str, var: &str) {
        self.fallback(key, std::env::var(var).ok());
    }

    /// One line per declared key, for `--help` style output.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (key, setting) in &self.values {
            out.push_str(&format!("  --{}=<value>  {}\n", key, setting.help));
        }
        out
    }
}

/// Config file path: the first positional argument, or `config.toml`.
pub fn config_path(args: &[String]) -> PathBuf {
    args.iter()
        .skip(1)
        .find(|a| !a.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// `--section.key=value` arguments, in command-line order.
pub fn cli_overrides(args: &[String]) -> Vec<(String, String)> {
    args.iter()
        .skip(1)
        .filter_map(|a| a.strip_prefix("--"))
        .filter_map(|a| a.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Load a TOML config file and flatten it to `section.key` pairs.
///
/// A missing file is not an error: credentials may come from the command
/// line or the environment alone.
pub fn load_file(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        info!("Config file not found: {}, using defaults", path.display());
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_toml(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_toml(content: &str) -> Result<Vec<(String, String)>> {
    let table: toml::Table = toml::from_str(content)?;
    let mut out = Vec::new();
    flatten("", &table, &mut out);
    Ok(out)
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut Vec<(String, String)>) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten(&full, inner, out),
            other => out.push((full, scalar_to_string(other))),
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        // Credential lists may be written as arrays; they become CSV.
        toml::Value::Array(items) => items
            .iter()
            .map(scalar_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

/// Keys every deployment has, independent of the configured protocols.
pub fn declare_general(settings: &mut Settings) {
    settings.declare("general.debug", "false", "Enable debug logging");
    settings.declare(
        "general.max_in_flight",
        "32",
        "Maximum number of events processed concurrently",
    );
    settings.declare(
        "general.data_dir",
        "data",
        "Directory for the per-channel image store",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flatten_sections() {
        let pairs = parse_toml(
            r#"
[general]
debug = true
max_in_flight = 4

[telegram]
credentials = ["111:aaa", "222:bbb"]
prefix = "/"
"#,
        )
        .unwrap();

        assert!(pairs.contains(&("general.debug".into(), "true".into())));
        assert!(pairs.contains(&("general.max_in_flight".into(), "4".into())));
        assert!(pairs.contains(&("telegram.credentials".into(), "111:aaa,222:bbb".into())));
        assert!(pairs.contains(&("telegram.prefix".into(), "/".into())));
    }

    #[test]
    fn test_command_line_wins_over_file() {
        let mut settings = Settings::new();
        settings.declare("skype.prefix", "!", "prefix");
        settings.apply_overrides(vec![("skype.prefix".into(), "?".into())]);
        settings.apply_overrides(cli_overrides(&args(&["bot", "--skype.prefix=#"])));
        assert_eq!(settings.get("skype.prefix"), "#");
    }

    #[test]
    fn test_unknown_override_is_ignored() {
        let mut settings = Settings::new();
        settings.apply_overrides(vec![("nope.key".into(), "x".into())]);
        assert!(!settings.set("nope.key", "y"));
        assert_eq!(settings.get("nope.key"), "");
        assert!(!settings.describe().contains("nope.key"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_unknown_override_warning_is_logged() {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut settings = Settings::new();
            declare_general(&mut settings);
            settings.apply_overrides(vec![("genral.debug".into(), "true".into())]);
        });

        let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("Ignoring unknown setting: genral.debug"));
    }

    #[test]
    fn test_fallback_only_fills_empty() {
        let mut settings = Settings::new();
        settings.declare("telegram.credentials", "", "creds");
        settings.fallback("telegram.credentials", Some("  token  ".into()));
        assert_eq!(settings.get("telegram.credentials"), "token");

        settings.fallback("telegram.credentials", Some("other".into()));
        assert_eq!(settings.get("telegram.credentials"), "token");
    }

    #[test]
    fn test_config_path_and_overrides() {
        let argv = args(&["bot", "--general.debug=yes", "my.toml"]);
        assert_eq!(config_path(&argv), PathBuf::from("my.toml"));
        assert_eq!(
            cli_overrides(&argv),
            vec![("general.debug".to_string(), "yes".to_string())]
        );
        assert_eq!(config_path(&args(&["bot"])), PathBuf::from("config.toml"));
    }

    #[test]
    fn test_typed_getters() {
        let mut settings = Settings::new();
        declare_general(&mut settings);
        settings.set("general.debug", "yes");
        assert!(settings.get_bool("general.debug"));
        assert_eq!(settings.get_parsed::<usize>("general.max_in_flight").unwrap(), 32);

        settings.set("general.max_in_flight", "many");
        assert!(settings.get_parsed::<usize>("general.max_in_flight").is_err());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pairs = load_file(&dir.path().join("absent.toml")).unwrap();
        assert!(pairs.is_empty());
    }
}
