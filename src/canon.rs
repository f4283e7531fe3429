//! Path canonicalization.
//!
//! Every path the pipeline stores is a canonical path relative to the source
//! root, with `/` separators.  Rule matching and graph lookups compare these
//! strings directly, so all paths pass through here first.

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar".
/// Backslashes are treated as separators.
pub fn canon_path(path: &str) -> String {
    let absolute = path.starts_with('/') || path.starts_with('\\');
    let mut components: Vec<&str> = Vec::new();
    for component in path.split(|c| c == '/' || c == '\\') {
        match component {
            "" | "." => {}
            ".." => match components.last() {
                Some(&last) if last != ".." => {
                    components.pop();
                }
                // Can't back up past the root of an absolute path.
                _ if absolute => {}
                _ => components.push(".."),
            },
            _ => components.push(component),
        }
    }
    let joined = components.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Whether a path is already canonical, relative, and stays below its root.
pub fn is_normalized_relative(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && path.split('/').next() != Some("..")
        && canon_path(path) == path
}

/// The directory part of a canonical path, "" for top-level files.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Resolve `rel` against the directory `dir`.
pub fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        canon_path(rel)
    } else {
        canon_path(&format!("{}/{}", dir, rel))
    }
}

/// Split the file name of a path into stem and extension:
/// "img/logo.png" => ("logo", "png"), "Makefile" => ("Makefile", "").
/// A leading dot is part of the stem, so ".babelrc" has no extension.
pub fn split_name(path: &str) -> (&str, &str) {
    let name = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => (&name[..idx], &name[idx + 1..]),
    }
}

/// Compute a relative URL from the directory `from_dir` to `to`, both
/// canonical and relative to the same root.
pub fn relative_url(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|c| !c.is_empty()).collect();
    let target: Vec<&str> = to.split('/').collect();
    let common = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    // The last target component is the file name; never consume it.
    let common = common.min(target.len().saturating_sub(1));
    let mut parts: Vec<&str> = Vec::new();
    for _ in common..from.len() {
        parts.push("..");
    }
    parts.extend(&target[common..]);
    parts.join("/")
}
