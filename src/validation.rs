use crate::error::{AppError, Result};

const MAX_APP_NAME_LEN: usize = 64;

/// App names double as pm2 process names and appear in log paths, so they
/// are limited to `[A-Za-z0-9._-]` without a leading `-` or `.`.
pub fn validate_app_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        AppError::other("Invalid app name")
            .context("app", name)
            .context("reason", reason)
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_APP_NAME_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err(invalid("starts with '-' or '.'"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid("contains characters outside [A-Za-z0-9._-]"));
    }
    Ok(())
}
