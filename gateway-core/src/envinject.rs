//! Builds the environment a spawned child process sees: a sanitized base,
//! overlaid with the template's own `env`, with the `SANDBOX=portable` and
//! `SANDBOX_{NODE,PYTHON,GO}_DIR` conventions applied on top.

use std::collections::HashMap;
use std::env;

const BASE_VARS: &[&str] = &["PATH", "HOME", "LANG", "TZ"];
const PROXY_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

pub fn build_child_env(template_env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for key in BASE_VARS {
        if let Ok(value) = env::var(key) {
            out.insert((*key).to_string(), value);
        }
    }

    for (k, v) in template_env {
        out.insert(k.clone(), v.clone());
    }

    if template_env.get("SANDBOX").map(String::as_str) == Some("portable") {
        for key in PROXY_VARS {
            out.insert((*key).to_string(), String::new());
        }
        out.insert("npm_config_prefer_offline".to_string(), "true".to_string());
    }

    for (sandbox_key, bin_subdir) in [
        ("SANDBOX_NODE_DIR", "bin"),
        ("SANDBOX_PYTHON_DIR", "bin"),
        ("SANDBOX_GO_DIR", "bin"),
    ] {
        if let Some(dir) = template_env.get(sandbox_key) {
            let bin_dir = if cfg!(windows) {
                format!("{dir}\\Scripts")
            } else {
                format!("{dir}/{bin_subdir}")
            };
            let existing = out.get("PATH").cloned().unwrap_or_default();
            let sep = if cfg!(windows) { ';' } else { ':' };
            out.insert(
                "PATH".to_string(),
                if existing.is_empty() {
                    bin_dir
                } else {
                    format!("{bin_dir}{sep}{existing}")
                },
            );
        }
    }

    out
}
