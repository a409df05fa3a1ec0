use crate::parallel::{ApplyOptions, ExecutionStrategy, SpawnContext};
use anyhow::{Context, Result, anyhow, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

// Embed the default config at compile time
const DEFAULT_CONFIG: &str = include_str!("../../default-config.toml");

/// Settings installed for the whole process, if any.
static INSTALLED: OnceLock<Settings> = OnceLock::new();

/// Merged parapply configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Worker counts, chunking, pacing and progress
    pub parallel: ParallelSettings,

    /// Worker thread creation
    pub spawn: SpawnSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelSettings {
    /// Maximum number of workers (0 = no limit)
    pub max_workers: usize,

    /// Percentage of CPU cores to use (1-100)
    pub thread_percentage: u8,

    /// Contiguous items per submission
    pub chunk_size: usize,

    /// Minimum delay between item releases, in milliseconds
    pub pause_ms: u64,

    /// Show a progress bar
    pub progress: bool,

    /// Keep workers across tasks
    pub reuse_workers: bool,

    /// Force sequential execution everywhere
    pub sequential: bool,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            max_workers: 0,
            thread_percentage: 100,
            chunk_size: 1,
            pause_ms: 0,
            progress: false,
            reuse_workers: true,
            sequential: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnSettings {
    /// Prefix of worker thread names
    pub thread_name: String,

    /// Worker stack size in KiB (0 = platform default)
    pub stack_size_kib: usize,

    /// Let code on workers start nested parallel work
    pub child_spawn: bool,
}

impl Default for SpawnSettings {
    fn default() -> Self {
        Self {
            thread_name: "parapply-worker".to_string(),
            stack_size_kib: 0,
            child_spawn: true,
        }
    }
}

impl Settings {
    /// Load settings from every source, lowest priority first:
    /// embedded defaults, user config, repository config, `custom_config`,
    /// then `PARAPPLY_` environment variables (`__` separates sections).
    pub fn load(custom_config: Option<&str>) -> Result<Self> {
        tracing::trace!("CONFIG LOAD: Starting");

        let mut figment = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG)) // Embedded defaults
            .merge(Toml::file(Self::user_config_path())) // User config
            .merge(Toml::file("parapply.toml")); // Repository config

        if let Some(custom_path) = custom_config {
            figment = figment.merge(Toml::file(custom_path));
        }

        // Environment variables always have highest priority
        figment = figment.merge(Env::prefixed("PARAPPLY_").split("__"));

        let settings: Settings = figment.extract().context("invalid parapply configuration")?;
        settings.validate()?;

        tracing::trace!(?settings, "CONFIG LOAD: Done");
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (1..=100).contains(&self.parallel.thread_percentage),
            "parallel.thread_percentage must be between 1 and 100, got {}",
            self.parallel.thread_percentage
        );
        ensure!(
            !self.spawn.thread_name.is_empty(),
            "spawn.thread_name must not be empty"
        );
        Ok(())
    }

    /// Make these settings the process-wide defaults.
    ///
    /// Call once at startup. Also installs the matching default spawn context.
    pub fn install(self) -> Result<()> {
        let spawn = self.spawn_context();
        INSTALLED
            .set(self)
            .map_err(|_| anyhow!("parapply settings are already installed"))?;
        SpawnContext::install_default(spawn)
    }

    /// The settings installed with [`install`](Self::install), if any.
    pub fn installed() -> Option<&'static Settings> {
        INSTALLED.get()
    }

    /// Worker count these settings allow (0 when sequential is forced).
    pub fn worker_count(&self) -> usize {
        if self.parallel.sequential {
            0
        } else {
            ExecutionStrategy::calculate_optimal_workers(self.parallel.max_workers, self.parallel.thread_percentage)
        }
    }

    pub fn spawn_context(&self) -> SpawnContext {
        let context = SpawnContext::new(self.spawn.thread_name.clone()).with_child_spawn(self.spawn.child_spawn);
        match self.spawn.stack_size_kib {
            0 => context,
            kib => context.with_stack_size(kib * 1024),
        }
    }

    /// Options for [`parallel_apply`](crate::parallel_apply) built from these settings.
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            n_workers: self.worker_count(),
            chunk_size: self.parallel.chunk_size,
            pause: Duration::from_millis(self.parallel.pause_ms),
            progress: self.parallel.progress,
            total: None,
            reuse_workers: self.parallel.reuse_workers,
            spawn: Some(self.spawn_context()),
        }
    }

    fn user_config_path() -> String {
        match std::env::var("HOME") {
            Ok(home) => format!("{}/.config/parapply/config.toml", home),
            Err(_) => "~/.config/parapply/config.toml".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let from_file: Settings = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG))
            .extract()
            .unwrap();
        assert_eq!(from_file, Settings::default());
    }

    #[test]
    fn test_load_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings.parallel.chunk_size, 1);
            assert!(settings.parallel.reuse_workers);
            assert_eq!(settings.spawn.thread_name, "parapply-worker");
            Ok(())
        });
    }

    #[test]
    fn test_repo_file_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "parapply.toml",
                r#"
                [parallel]
                chunk_size = 4
                pause_ms = 25
                "#,
            )?;
            jail.set_env("PARAPPLY_PARALLEL__CHUNK_SIZE", "8");
            jail.set_env("PARAPPLY_SPAWN__THREAD_NAME", "crunch");

            let settings = Settings::load(None).map_err(|e| e.to_string())?;
            assert_eq!(settings.parallel.chunk_size, 8);
            assert_eq!(settings.parallel.pause_ms, 25);
            assert_eq!(settings.spawn.thread_name, "crunch");
            Ok(())
        });
    }

    #[test]
    fn test_custom_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[parallel]\nsequential = true\nreuse_workers = false").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        Jail::expect_with(|_jail| {
            let settings = Settings::load(Some(&path)).map_err(|e| e.to_string())?;
            assert!(settings.parallel.sequential);
            assert!(!settings.parallel.reuse_workers);
            assert_eq!(settings.worker_count(), 0);
            assert_eq!(settings.apply_options().n_workers, 0);
            Ok(())
        });
    }

    #[test]
    fn test_missing_custom_config_falls_back() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load(Some("non_existent.toml")).map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_percentage_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("parapply.toml", "[parallel]\nthread_percentage = 0\n")?;
            assert!(Settings::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_apply_options_conversion() {
        let mut settings = Settings::default();
        settings.parallel.max_workers = 2;
        settings.parallel.pause_ms = 40;
        settings.spawn.stack_size_kib = 512;

        let options = settings.apply_options();
        assert!(options.n_workers >= 1 && options.n_workers <= 2);
        assert_eq!(options.pause, Duration::from_millis(40));
        let spawn = options.spawn.unwrap();
        assert_eq!(spawn.stack_size, Some(512 * 1024));
        assert_eq!(spawn.name_prefix, "parapply-worker");
        assert!(spawn.child_spawn);
    }
}
