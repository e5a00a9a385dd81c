//! Validation helpers for bus names, object paths, and member names.
//!
//! These checks run at registration time, not at call time: a name that
//! passes here is trusted by the rest of the core.

use thiserror::Error;

/// Maximum length in bytes of any bus, interface, or member name.
pub const MAX_NAME_LEN: usize = 255;

/// Validation error types for names and paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} is empty")]
    Empty { kind: &'static str },

    #[error("{kind} '{value}' exceeds {MAX_NAME_LEN} bytes")]
    TooLong { kind: &'static str, value: String },

    #[error("object path '{0}' must be absolute (start with '/')")]
    PathNotAbsolute(String),

    #[error("object path '{0}' has an empty or trailing element")]
    PathEmptyElement(String),

    #[error("object path '{0}' contains an invalid character")]
    PathBadCharacter(String),

    #[error("interface name '{0}' needs at least two dot-separated elements")]
    InterfaceTooFewElements(String),

    #[error("{kind} '{value}' contains an invalid element")]
    BadElement { kind: &'static str, value: String },
}

/// Result type for validation operations.
pub type ValidationResult = Result<(), ValidationError>;

fn element_ok(elem: &str, allow_leading_digit: bool) -> bool {
    let mut chars = elem.chars();
    match chars.next() {
        None => return false,
        Some(c) => {
            if !(c.is_ascii_alphabetic() || c == '_' || (allow_leading_digit && c.is_ascii_digit()))
            {
                return false;
            }
        }
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate an object path: absolute, slash-separated, `[A-Za-z0-9_]`
/// elements, no empty elements, no trailing slash except the root path `/`.
pub fn validate_object_path(path: &str) -> ValidationResult {
    if path.is_empty() {
        return Err(ValidationError::Empty {
            kind: "object path",
        });
    }
    if path.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            kind: "object path",
            value: path.to_string(),
        });
    }
    if !path.starts_with('/') {
        return Err(ValidationError::PathNotAbsolute(path.to_string()));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(ValidationError::PathEmptyElement(path.to_string()));
    }
    for elem in path[1..].split('/') {
        if elem.is_empty() {
            return Err(ValidationError::PathEmptyElement(path.to_string()));
        }
        if !elem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ValidationError::PathBadCharacter(path.to_string()));
        }
    }
    Ok(())
}

/// Validate an interface name: dot-separated, at least two elements, each
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_interface_name(name: &str) -> ValidationResult {
    if name.is_empty() {
        return Err(ValidationError::Empty {
            kind: "interface name",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            kind: "interface name",
            value: name.to_string(),
        });
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        return Err(ValidationError::InterfaceTooFewElements(name.to_string()));
    }
    for elem in elements {
        if !element_ok(elem, false) {
            return Err(ValidationError::BadElement {
                kind: "interface name",
                value: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Validate a member (method, signal, or property) name: a single element,
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_member_name(name: &str) -> ValidationResult {
    if name.is_empty() {
        return Err(ValidationError::Empty {
            kind: "member name",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            kind: "member name",
            value: name.to_string(),
        });
    }
    if !element_ok(name, false) {
        return Err(ValidationError::BadElement {
            kind: "member name",
            value: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a bus name.
///
/// Accepts well-known names (dot-separated like interface names) and unique
/// names of the form `:GUID.N` where elements may start with a digit.
pub fn validate_bus_name(name: &str) -> ValidationResult {
    if name.is_empty() {
        return Err(ValidationError::Empty { kind: "bus name" });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            kind: "bus name",
            value: name.to_string(),
        });
    }
    let (unique, body) = match name.strip_prefix(':') {
        Some(rest) => (true, rest),
        None => (false, name),
    };
    let elements: Vec<&str> = body.split('.').collect();
    if elements.len() < 2 {
        return Err(ValidationError::InterfaceTooFewElements(name.to_string()));
    }
    for elem in elements {
        if !element_ok(elem, unique) {
            return Err(ValidationError::BadElement {
                kind: "bus name",
                value: name.to_string(),
            });
        }
    }
    Ok(())
}
