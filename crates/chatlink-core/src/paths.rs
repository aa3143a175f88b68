use std::path::PathBuf;

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn home_dir_with<F>(lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in ["HOME", "USERPROFILE"] {
        if let Some(value) = lookup(key) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }

    Err("Home directory not set".to_string())
}

/// Default directory for persisted client state: `{home}/.config/chatlink`.
pub fn default_config_dir_with<F>(lookup: F) -> Result<PathBuf, String>
where
    F: Fn(&str) -> Option<String>,
{
    let home = home_dir_with(lookup)?;
    Ok(PathBuf::from(home).join(".config").join("chatlink"))
}
