//! Tunable inspection.

use dblayer_core::{tunables, DbLayerConfig};

use super::Settings;

/// Prints every tunable, or only `name`, as text or JSON.
pub fn show(
    settings: &Settings,
    name: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = settings.load()?;
    print(&config, name, format)
}

/// Prints the built-in defaults.
pub fn defaults(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    print(&DbLayerConfig::default(), None, format)
}

fn print(
    config: &DbLayerConfig,
    name: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let values = match name {
        Some(name) => {
            let tunable = tunables::find(name).ok_or_else(|| format!("unknown tunable {name}"))?;
            vec![(tunable.name, tunables::get(config, tunable.name)?)]
        }
        None => tunables::snapshot(config),
    };
    match format {
        "json" => {
            let map: serde_json::Map<String, serde_json::Value> = values
                .into_iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
        "text" => {
            for (key, value) in values {
                println!("{key}: {value}");
            }
        }
        other => return Err(format!("unknown format {other}; use text or json").into()),
    }
    Ok(())
}
