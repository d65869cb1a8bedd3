// depot-common/src/validation.rs
//
// Local syntax checks performed before any RPC call or filesystem
// mutation, so that malformed input never costs a network round-trip.

use super::error::{DepotError, Result};

/// Checks that a package name looks like "a/b/c": one or more non-empty
/// path segments of lowercase letters, digits, '-' and '_'.
pub fn validate_package_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(DepotError::InvalidPackageName(name.to_string()))
    }
}

/// Checks that a string is a well-formed instance ID: the lowercase hex
/// SHA-1 of the package file, exactly 40 characters.
pub fn validate_instance_id(id: &str) -> Result<()> {
    let valid = id.len() == 40
        && id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if valid {
        Ok(())
    } else {
        Err(DepotError::InvalidInstanceId(id.to_string()))
    }
}

/// Returns true if the version string is already a concrete instance ID
/// (as opposed to a tag or ref that needs backend resolution).
pub fn is_instance_id(version: &str) -> bool {
    validate_instance_id(version).is_ok()
}

/// Checks that an instance tag looks like "key:value": a key made of the
/// same characters as a package name segment, and a non-empty value.
pub fn validate_instance_tag(tag: &str) -> Result<()> {
    let valid = tag.len() <= 400
        && matches!(tag.split_once(':'), Some((key, value)) if !key.is_empty()
            && !value.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(DepotError::Validation(format!("Invalid tag '{tag}'")))
    }
}

/// Checks that a version string is plausible as an instance ID, tag or
/// ref: non-empty, printable, no whitespace.
pub fn validate_version(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_graphic() || !c.is_ascii());
    if valid {
        Ok(())
    } else {
        Err(DepotError::Validation(format!(
            "Invalid version string '{version}'"
        )))
    }
}
