//! The layered step-configuration loader (C8): a step's `config` mapping is
//! written to disk, deserialized into the built-in's parameter struct, then
//! overlaid with `KUDE_`-prefixed environment variables, which win.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::Value;

use crate::Result;

const ENV_PREFIX: &str = "KUDE_";

/// write_config_file marshals a step's config mapping to
/// `<temp_dir>/<step_id>.yaml`, matching the path the container runner
/// binds into the sandbox at `/etc/kude/function/config.yaml`.
pub fn write_config_file(temp_dir: &Path, step_id: &str, config: &Value) -> Result<std::path::PathBuf> {
    let path = temp_dir.join(format!("{step_id}.yaml"));
    let file = std::fs::File::create(&path)?;
    serde_yaml::to_writer(file, config)?;
    Ok(path)
}

/// load reads the step config file written by [`write_config_file`],
/// overlays top-level `KUDE_`-prefixed environment variables (env wins,
/// unknown keys from either source are ignored), and deserializes the
/// result into `T`.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    let mut value: Value = serde_yaml::from_str(&text)?;
    overlay_env(&mut value);
    Ok(serde_yaml::from_value(value)?)
}

fn overlay_env(value: &mut Value) {
    if !matches!(value, Value::Mapping(_)) {
        *value = Value::Mapping(serde_yaml::Mapping::new());
    }
    let Value::Mapping(map) = value else {
        unreachable!()
    };
    for (key, val) in std::env::vars() {
        let Some(field) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let field = field.to_lowercase();
        map.insert(Value::String(field), Value::String(val));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Params {
        name: String,
        #[serde(default)]
        value: String,
    }

    #[test]
    fn env_overrides_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let config: Value = serde_yaml::from_str("name: foo\nvalue: bar\n").unwrap();
        let path = write_config_file(dir.path(), "001", &config).unwrap();

        // SAFETY: test runs single-threaded with respect to this env var.
        unsafe { std::env::set_var("KUDE_VALUE", "overridden") };
        let params: Params = load(&path).unwrap();
        unsafe { std::env::remove_var("KUDE_VALUE") };

        assert_eq!(
            params,
            Params {
                name: "foo".to_owned(),
                value: "overridden".to_owned()
            }
        );
    }

    #[test]
    fn unknown_env_keys_are_ignored_when_target_denies_them() {
        let dir = tempfile::tempdir().unwrap();
        let config: Value = serde_yaml::from_str("name: foo\n").unwrap();
        let path = write_config_file(dir.path(), "002", &config).unwrap();

        unsafe { std::env::set_var("KUDE_UNRELATED_THING", "x") };
        let params: Params = load(&path).unwrap();
        unsafe { std::env::remove_var("KUDE_UNRELATED_THING") };

        assert_eq!(params.name, "foo");
    }
}
