use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use config::{Config, File};
use serde::Deserialize;
use serde_json::Value;

/// File extensions indexed when nothing else is configured.
pub const DEFAULT_FILE_EXTENSIONS: &[&str] = &["retab", "hcl", "tf", "tfvars"];

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory base names the walker never descends into
    pub ignore_directory_names: Vec<String>,
    /// Extensions (without the dot) of the files that make up a module
    pub file_extensions: Vec<String>,
    /// Concurrently running indexing jobs
    pub workers: usize,
    /// How long a handler waits for its jobs before answering "not ready"
    pub wait_timeout_ms: u64,
    pub log_filter: String,
}

/// The parts of the client's `initializationOptions` we understand.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct InitializationOptions {
    #[serde(default)]
    indexing: IndexingOptions,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct IndexingOptions {
    ignore_directory_names: Option<Vec<String>>,
    workers: Option<usize>,
}

impl InitializationOptions {
    fn parse(options: Option<&Value>) -> anyhow::Result<InitializationOptions> {
        let options = match options {
            None | Some(Value::Null) => return Ok(InitializationOptions::default()),
            Some(options) => serde_json::from_value::<InitializationOptions>(options.clone())
                .context("invalid initializationOptions")?,
        };

        if let Some(names) = &options.indexing.ignore_directory_names {
            if let Some(path) = names.iter().find(|name| name.contains(['/', '\\'])) {
                bail!("ignoreDirectoryNames expects directory names, not paths: {path}");
            }
        }

        Ok(options)
    }
}

impl Settings {
    /// Loads settings from `~/.config/retab-ls/settings`, then
    /// `<root_dir>/.retab-ls`, then the client's initialization options.
    pub fn new(root_dir: Option<&Path>, initialization_options: Option<&Value>) -> anyhow::Result<Settings> {
        let expanded = shellexpand::tilde("~/.config/retab-ls/settings");
        let mut builder = Config::builder().add_source(File::with_name(&expanded).required(false));

        if let Some(root_dir) = root_dir {
            builder = builder.add_source(
                File::with_name(&format!(
                    "{}/.retab-ls",
                    root_dir
                        .to_str()
                        .ok_or(anyhow!("Can't convert root_dir to str"))?
                ))
                .required(false),
            );
        }

        let overrides = InitializationOptions::parse(initialization_options)?.indexing;

        let settings = builder
            .set_default("ignore_directory_names", Vec::<String>::new())?
            .set_default("file_extensions", DEFAULT_FILE_EXTENSIONS.to_vec())?
            .set_default("workers", 4_i64)?
            .set_default("wait_timeout_ms", 5000_i64)?
            .set_default("log_filter", "info")?
            .set_override_option("ignore_directory_names", overrides.ignore_directory_names)?
            .set_override_option("workers", overrides.workers.map(|workers| workers as i64))?
            .build()
            .map_err(|err| anyhow!("Build err: {err}"))?;

        let settings = settings.try_deserialize::<Settings>()?;

        anyhow::Ok(settings)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            ignore_directory_names: vec![],
            file_extensions: DEFAULT_FILE_EXTENSIONS
                .iter()
                .map(|extension| extension.to_string())
                .collect(),
            workers: 4,
            wait_timeout_ms: 5000,
            log_filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_utils::{create_test_workspace_dir, write_file};

    #[test]
    fn workspace_file_is_layered_over_defaults() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(
            &root,
            ".retab-ls.toml",
            "ignore_directory_names = [\"node_modules\"]\nwait_timeout_ms = 250\n",
        );

        let settings = Settings::new(Some(root.as_path()), None).unwrap();

        assert_eq!(settings.ignore_directory_names, vec!["node_modules"]);
        assert_eq!(settings.wait_timeout(), Duration::from_millis(250));
        assert_eq!(settings.file_extensions, Settings::default().file_extensions);
    }

    #[test]
    fn initialization_options_override_files() {
        let (_temp_dir, root) = create_test_workspace_dir();
        write_file(&root, ".retab-ls.toml", "workers = 8\nignore_directory_names = [\"a\"]\n");
        let options = json!({
            "indexing": {
                "ignoreDirectoryNames": ["vendor", ".terraform"],
                "workers": 2
            }
        });

        let settings = Settings::new(Some(root.as_path()), Some(&options)).unwrap();

        assert_eq!(settings.ignore_directory_names, vec!["vendor", ".terraform"]);
        assert_eq!(settings.workers, 2);
    }

    #[test]
    fn null_or_unrelated_options_are_ignored() {
        let (_temp_dir, root) = create_test_workspace_dir();

        let from_null = Settings::new(Some(root.as_path()), Some(&Value::Null)).unwrap();
        let from_other = Settings::new(Some(root.as_path()), Some(&json!({ "format": true }))).unwrap();

        assert_eq!(from_null.workers, from_other.workers);
        assert_eq!(from_null.log_filter, "info");
    }

    #[test]
    fn paths_are_rejected_as_ignore_names() {
        let options = json!({ "indexing": { "ignoreDirectoryNames": ["modules/cache"] } });

        let err = Settings::new(None, Some(&options)).unwrap_err();

        assert!(err.to_string().contains("modules/cache"));
    }
}
