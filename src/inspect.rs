/// Core config inspection: does this config need an elevated start?
///
/// The supervisor does not know how the core config is produced; it only
/// asks whether the config declares a TUN inbound.
use serde_json::Value;
use std::path::Path;

pub trait ConfigInspector: Send + Sync {
    fn requires_elevation(&self, config: &Path) -> bool;

    /// Name of the TUN interface the config creates, if it sets one.
    fn tun_interface(&self, _config: &Path) -> Option<String> {
        None
    }
}

/// Reads the core's JSON config and looks for an inbound of type `tun`.
pub struct TunInspector;

/// Always answers with a fixed value.
pub struct FixedInspector(pub bool);

/// Whether a parsed config declares a TUN inbound.
pub fn declares_tun(config: &Value) -> bool {
    config
        .get("inbounds")
        .and_then(Value::as_array)
        .is_some_and(|inbounds| {
            inbounds
                .iter()
                .any(|inbound| inbound.get("type").and_then(Value::as_str) == Some("tun"))
        })
}

/// `interface_name` of the first TUN inbound that sets one.
pub fn tun_interface_name(config: &Value) -> Option<String> {
    config
        .get("inbounds")?
        .as_array()?
        .iter()
        .filter(|inbound| inbound.get("type").and_then(Value::as_str) == Some("tun"))
        .find_map(|inbound| inbound.get("interface_name").and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn read_config(config: &Path) -> Option<Value> {
    let contents = match std::fs::read_to_string(config) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, path = %config.display(), "failed to read core config");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, path = %config.display(), "core config is not valid JSON");
            None
        }
    }
}

impl ConfigInspector for TunInspector {
    fn requires_elevation(&self, config: &Path) -> bool {
        read_config(config).is_some_and(|value| declares_tun(&value))
    }

    fn tun_interface(&self, config: &Path) -> Option<String> {
        tun_interface_name(&read_config(config)?)
    }
}

impl ConfigInspector for FixedInspector {
    fn requires_elevation(&self, _config: &Path) -> bool {
        self.0
    }
}
