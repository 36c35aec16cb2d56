// Worker configuration: environment settings plus per-language runtimes
use anyhow::{bail, Context, Result};
use arena_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub languages_path: PathBuf,
    /// Parent directory of per-run workspaces
    pub scratch_dir: PathBuf,
    /// Run locally when the sandbox backend is unreachable
    pub local_fallback: bool,
    /// Skip the sandbox entirely. Trusted/dev environments only.
    pub force_local: bool,
    pub lease_ttl: Duration,
    pub poll_timeout_secs: f64,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: arena_common::config::redis_url(),
            languages_path: std::env::var("ARENA_LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LANGUAGES_PATH)),
            scratch_dir: std::env::var("ARENA_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            local_fallback: env_flag("ARENA_LOCAL_FALLBACK", true),
            force_local: env_flag("ARENA_FORCE_LOCAL", false),
            lease_ttl: Duration::from_secs(
                std::env::var("ARENA_LEASE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            poll_timeout_secs: 5.0,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_flag(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_compile_secs() -> u64 {
    12
}

fn default_local_compile_secs() -> u64 {
    10
}

/// Wall-clock budgets for one language, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_compile_secs")]
    pub compile_secs: u64,
    #[serde(default = "default_local_compile_secs")]
    pub local_compile_secs: u64,
    pub run_secs: u64,
    pub local_run_secs: u64,
}

impl Timeouts {
    pub fn compile(&self) -> Duration {
        Duration::from_secs(self.compile_secs)
    }

    /// Never longer than the sandboxed budget: nothing else caps a local run
    pub fn local_compile(&self) -> Duration {
        Duration::from_secs(self.local_compile_secs.min(self.compile_secs))
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn local_run(&self) -> Duration {
        Duration::from_secs(self.local_run_secs.min(self.run_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub image: String,
    pub timeouts: Timeouts,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from a languages.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            let language = Language::parse(&lang.name);
            if !language.is_supported() {
                bail!("Unknown language '{}' in languages.json", lang.name);
            }
            configs.insert(language, lang);
        }

        if configs.is_empty() {
            bail!("No languages configured in languages.json");
        }

        Ok(Self { configs })
    }

    /// Python and C with the stock runner images
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();
        configs.insert(
            Language::Python,
            LanguageConfig {
                name: "python".to_string(),
                image: "devarena/python-runner:latest".to_string(),
                timeouts: Timeouts {
                    compile_secs: default_compile_secs(),
                    local_compile_secs: default_local_compile_secs(),
                    run_secs: 8,
                    local_run_secs: 5,
                },
            },
        );
        configs.insert(
            Language::C,
            LanguageConfig {
                name: "c".to_string(),
                image: "devarena/c-runner:latest".to_string(),
                timeouts: Timeouts {
                    compile_secs: 12,
                    local_compile_secs: 10,
                    run_secs: 6,
                    local_run_secs: 5,
                },
            },
        );
        Self { configs }
    }

    /// Load `config_path` if it exists, otherwise fall back to the built-in set
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            tracing::warn!(
                path = %config_path.display(),
                "Language config not found, using built-in defaults"
            );
            Ok(Self::builtin())
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    pub fn configs(&self) -> impl Iterator<Item = (&Language, &LanguageConfig)> {
        self.configs.iter()
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_covers_reference_runtimes() {
        let manager = LanguageConfigManager::builtin();
        assert_eq!(manager.list_languages(), vec!["c", "python"]);
        assert_eq!(manager.get_config(&Language::Python).unwrap().timeouts.run_secs, 8);
        assert!(manager.get_config(&Language::parse("Java")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"languages": [{{"name": "Python", "image": "py:test", "timeouts": {{"run_secs": 3, "local_run_secs": 2}}}}]}}"#
        )
        .unwrap();

        let manager = LanguageConfigManager::load(file.path()).unwrap();
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.image, "py:test");
        assert_eq!(python.timeouts.compile_secs, 12);
        assert!(manager.get_config(&Language::C).is_err());
    }

    #[test]
    fn test_rejects_unknown_language() {
        let err = LanguageConfigManager::parse(
            r#"{"languages": [{"name": "cobol", "image": "x", "timeouts": {"run_secs": 1, "local_run_secs": 1}}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = LanguageConfigManager::load(Path::new("/nonexistent/languages.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_local_budget_never_exceeds_sandboxed() {
        let timeouts = Timeouts {
            compile_secs: 4,
            local_compile_secs: 10,
            run_secs: 3,
            local_run_secs: 9,
        };
        assert_eq!(timeouts.local_compile(), Duration::from_secs(4));
        assert_eq!(timeouts.local_run(), Duration::from_secs(3));
    }

    #[test]
    fn test_shipped_languages_json_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let manager = LanguageConfigManager::load(&path).unwrap();
        assert_eq!(manager.list_languages(), vec!["c", "python"]);
        assert_eq!(manager.get_config(&Language::C).unwrap().timeouts.compile_secs, 12);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
