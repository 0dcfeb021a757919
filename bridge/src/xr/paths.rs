//! Semantic path validation and conversion.
//!
//! Paths such as `/user/hand/left/input/trigger/value` are interned by the
//! runtime into opaque [`XrPath`] atoms. They are validated here first so a
//! typo in a binding table is reported with the offending component rather
//! than a bare runtime error code.

use anyhow::Context;
use thiserror::Error;

use super::runtime::{XrPath, XrRuntime};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path {0:?} must start with '/'")]
    NotAbsolute(String),
    #[error("path {0:?} must not end with '/'")]
    TrailingSlash(String),
    #[error("path {path:?} has an empty, '.' or '..' component")]
    BadComponent { path: String },
    #[error("path {path:?} contains invalid character {ch:?}")]
    InvalidCharacter { path: String, ch: char },
}

/// Check a path string against the well-formed path rules: absolute, no
/// trailing slash, no empty or dot components, and only lowercase ASCII
/// letters, digits, `-`, `_` and `.`.
pub fn validate_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| PathError::NotAbsolute(path.to_string()))?;
    if rest.is_empty() || path.ends_with('/') {
        return Err(PathError::TrailingSlash(path.to_string()));
    }
    for component in rest.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(PathError::BadComponent {
                path: path.to_string(),
            });
        }
        if let Some(ch) = component
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(*c)))
        {
            return Err(PathError::InvalidCharacter {
                path: path.to_string(),
                ch,
            });
        }
    }
    Ok(())
}

/// Validate and intern a path.
pub fn to_path<R: XrRuntime + ?Sized>(runtime: &mut R, path: &str) -> anyhow::Result<XrPath> {
    validate_path(path)?;
    runtime
        .string_to_path(path)
        .with_context(|| format!("VR: failed to create path {}", path))
}

/// Convert an interned path back to its string form.
pub fn to_string<R: XrRuntime + ?Sized>(runtime: &mut R, path: XrPath) -> anyhow::Result<String> {
    runtime
        .path_to_string(path)
        .with_context(|| format!("VR: failed to resolve path id {}", path.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xr::sim::{SimConfig, SimRuntime};

    #[test]
    fn test_valid_paths() {
        assert!(validate_path("/user/hand/left").is_ok());
        assert!(validate_path("/interaction_profiles/khr/simple_controller").is_ok());
        assert!(validate_path("/user/hand/right/input/thumbstick/x").is_ok());
        assert!(validate_path("/a.b-c_d").is_ok());
    }

    #[test]
    fn test_invalid_paths() {
        assert_eq!(validate_path(""), Err(PathError::Empty));
        assert!(matches!(
            validate_path("user/hand/left"),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            validate_path("/user/hand/"),
            Err(PathError::TrailingSlash(_))
        ));
        assert!(matches!(validate_path("/"), Err(PathError::TrailingSlash(_))));
        assert!(matches!(
            validate_path("/user//hand"),
            Err(PathError::BadComponent { .. })
        ));
        assert!(matches!(
            validate_path("/user/../hand"),
            Err(PathError::BadComponent { .. })
        ));
        assert!(matches!(
            validate_path("/user/Hand"),
            Err(PathError::InvalidCharacter { ch: 'H', .. })
        ));
    }

    #[test]
    fn test_profile_path_round_trip() {
        let mut sim = SimRuntime::new(SimConfig::default());
        sim.bootstrap_running_session().unwrap();
        for s in [
            "/interaction_profiles/oculus/touch_controller",
            "/interaction_profiles/valve/index_controller",
            "/user/hand/left/input/grip/pose",
        ] {
            let p = to_path(&mut sim, s).unwrap();
            assert_eq!(to_string(&mut sim, p).unwrap(), s);
        }
    }

    #[test]
    fn test_interning_is_stable() {
        let mut sim = SimRuntime::new(SimConfig::default());
        sim.bootstrap_running_session().unwrap();
        let a = to_path(&mut sim, "/user/hand/left").unwrap();
        let b = to_path(&mut sim, "/user/hand/left").unwrap();
        let c = to_path(&mut sim, "/user/hand/right").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_invalid_path_rejected_before_runtime() {
        let mut sim = SimRuntime::new(SimConfig::default());
        sim.bootstrap_running_session().unwrap();
        assert!(to_path(&mut sim, "/user/hand/Left").is_err());
    }
}
