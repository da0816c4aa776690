use super::types::*;
use crate::archive::KeyFormatter;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use crate::storage::EXTRA_MSG_PAYLOAD_SIZE;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string)
}

/// Parse a YAML document: expand `$env{VAR}` references and `~` in paths,
/// then validate.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with the actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    for destination in config.destinations.values_mut() {
        destination.store_path = expand_tilde(&destination.store_path);
    }
    for archive in config.archives.values_mut() {
        archive.path = expand_tilde(&archive.path);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.destinations.is_empty() && config.archives.is_empty() {
        errors.push(
            "config must have at least one entry under 'destinations' or 'archives'".to_string(),
        );
    }

    let mut names: Vec<&String> = config.destinations.keys().collect();
    names.sort();
    let mut store_paths: HashMap<PathBuf, &str> = HashMap::new();
    for name in names {
        let destination = &config.destinations[name];
        validate_destination(name, destination, &mut errors);

        let key = normalize(&destination.store_path);
        if let Some(other) = store_paths.insert(key, name) {
            errors.push(format!(
                "destination '{}': store_path '{}' is already used by destination '{}'",
                name,
                destination.store_path.display(),
                other
            ));
        }
    }

    let mut names: Vec<&String> = config.archives.keys().collect();
    names.sort();
    let mut archive_paths: HashMap<PathBuf, &str> = HashMap::new();
    for name in names {
        let archive = &config.archives[name];
        validate_archive(name, archive, &mut errors);

        if let Some(other) = archive_paths.insert(normalize(&archive.path), name) {
            errors.push(format!(
                "archive '{}': path '{}' is already used by archive '{}'",
                name,
                archive.path.display(),
                other
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_destination(name: &str, destination: &LogDestinationConfig, errors: &mut Vec<String>) {
    let prefix = format!("destination '{}'", name);

    if destination.endpoint.trim().is_empty() {
        errors.push(format!("{}: endpoint cannot be empty", prefix));
    }

    if !is_valid_group_name(&destination.group) {
        errors.push(format!(
            "{}: group '{}' must be 1-512 characters of letters, digits, '_', '-', '/', '.', '#'",
            prefix, destination.group
        ));
    }

    if let Some(stream) = &destination.stream {
        if stream.len() > 512 || stream.contains(':') || stream.contains('*') {
            errors.push(format!(
                "{}: stream '{}' must be at most 512 characters without ':' or '*'",
                prefix, stream
            ));
        }
    }

    if destination.store_path.as_os_str().is_empty() {
        errors.push(format!("{}: store_path cannot be empty", prefix));
    }

    if destination.max_batch_count == 0 {
        errors.push(format!("{}: max_batch_count must be at least 1", prefix));
    }

    if destination.max_batch_size_bytes <= 0 {
        errors.push(format!("{}: max_batch_size_bytes must be positive", prefix));
    }

    if destination.max_message_bytes <= EXTRA_MSG_PAYLOAD_SIZE {
        errors.push(format!(
            "{}: max_message_bytes must exceed the {} byte per-message overhead",
            prefix, EXTRA_MSG_PAYLOAD_SIZE
        ));
    }
}

fn validate_archive(name: &str, archive: &ArchiveConfig, errors: &mut Vec<String>) {
    let prefix = format!("archive '{}'", name);

    if archive.path.file_name().is_none() {
        errors.push(format!(
            "{}: path '{}' must name a file",
            prefix,
            archive.path.display()
        ));
    }

    if archive.endpoint.trim().is_empty() {
        errors.push(format!("{}: endpoint cannot be empty", prefix));
    }

    if archive.bucket.trim().is_empty() {
        errors.push(format!("{}: bucket cannot be empty", prefix));
    }

    if let Err(e) = KeyFormatter::new(&archive.key_pattern) {
        errors.push(format!("{}: {}", prefix, e));
    }

    if archive.max_file_size_bytes == 0 {
        errors.push(format!("{}: max_file_size_bytes must be positive", prefix));
    }
}

fn is_valid_group_name(group: &str) -> bool {
    !group.is_empty()
        && group.len() <= 512
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-/.#".contains(c))
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
destinations:
  app:
    endpoint: https://logs.example.com
    group: my-app
    store_path: /tmp/logship-app.duckdb
"#;

    fn validation_errors(yaml: &str) -> Vec<String> {
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => errors,
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_minimal_config() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.destinations.len(), 1);
        assert!(config.archives.is_empty());
        assert_eq!(config.destinations["app"].group, "my-app");
    }

    #[test]
    fn test_empty_config_rejected() {
        let errors = validation_errors("destinations: {}\n");
        assert!(errors[0].contains("at least one"));
    }

    #[test]
    fn test_shared_store_path_rejected() {
        let yaml = r#"
destinations:
  first:
    endpoint: https://logs.example.com
    group: a
    store_path: /tmp/logship-shared.duckdb
  second:
    endpoint: https://logs.example.com
    group: b
    store_path: /tmp/logship-shared.duckdb
"#;
        let errors = validation_errors(yaml);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("already used by destination 'first'"));
    }

    #[test]
    fn test_collects_every_problem() {
        let yaml = r#"
destinations:
  broken:
    endpoint: ""
    group: "bad group!"
    stream: "a:b"
    store_path: /tmp/logship-broken.duckdb
    max_batch_count: 0
    max_message_bytes: 10
archives:
  files:
    path: /var/log/app.log
    endpoint: http://minio:9000
    bucket: ""
    key_pattern: "logs/@%Y"
"#;
        let errors = validation_errors(yaml);
        assert_eq!(errors.len(), 7, "{:#?}", errors);
    }

    #[test]
    fn test_env_vars_expanded() {
        std::env::set_var("LOGSHIP_TEST_GROUP", "from-env");
        let yaml = MINIMAL.replace("my-app", "$env{LOGSHIP_TEST_GROUP}");
        let config = parse_config(&yaml).unwrap();
        assert_eq!(config.destinations["app"].group, "from-env");
        std::env::remove_var("LOGSHIP_TEST_GROUP");
    }

    #[test]
    fn test_unset_env_var_reported() {
        let yaml = MINIMAL.replace("my-app", "$env{LOGSHIP_SURELY_UNSET}");
        match parse_config(&yaml) {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("LOGSHIP_SURELY_UNSET")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_tilde_expanded_in_paths() {
        let yaml = MINIMAL.replace("/tmp/logship-app.duckdb", "~/logship/app.duckdb");
        let config = parse_config(&yaml).unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                config.destinations["app"].store_path,
                home.join("logship/app.duckdb")
            );
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/logship/config.yml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
