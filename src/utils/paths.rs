use std::env;
use std::path::PathBuf;

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn resolve_xdg_config_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_CONFIG_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".config"))
}

fn resolve_xdg_state_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_STATE_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".local").join("state"))
}

pub fn resolve_config_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("APILINK_CONFIG_PATH").ok()) {
        return path;
    }
    if let Some(dir) = resolve_xdg_config_dir() {
        return dir.join("apilink").join("api_config.json");
    }
    PathBuf::from("config/api_config.json")
}

pub fn resolve_sessions_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("APILINK_DATA_DIR").ok()) {
        return path.join("sessions");
    }
    if let Some(dir) = resolve_xdg_state_dir() {
        return dir.join("apilink").join("sessions");
    }
    PathBuf::from("api_data_storage")
}
