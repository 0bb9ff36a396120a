//! Candidate-supplied paths, always relative to the sandbox project root.

use std::path::{Component, Path};

/// Normalises a project-relative path, rejecting absolute paths and `..` components.
///
/// Leading `./` and repeated separators are dropped; an empty result is rejected.
pub fn normalize_relative(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path.trim()).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Absolute sandbox path of an already normalised relative path.
pub fn absolute(project_root: &str, relative: &str) -> String {
    format!("{}/{}", project_root.trim_end_matches('/'), relative)
}

/// Parent directory of a normalised relative path, if it has one.
pub fn parent_dir(relative: &str) -> Option<&str> {
    relative.rsplit_once('/').map(|(dir, _)| dir)
}
