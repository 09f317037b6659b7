//! Encoding between working-directory paths and project directory names.
//!
//! The monitored agent namespaces transcripts per working directory using a
//! flattened directory name: the path is prefixed with `-`, separators become
//! `-`, and literal dots become `--` so they survive the round trip.
//!
//! Decoding is best-effort only: a path component that contains a literal `-`
//! is indistinguishable from an encoded separator. Whenever a transcript
//! declares its own `cwd`, that value wins over the decoded name (see
//! [`crate::scanner`]).

use std::path::{Path, PathBuf};

/// Delimiter used in encoded directory names.
const DELIMITER: char = '-';

/// Stand-in used while untangling doubled delimiters during decode.
const PLACEHOLDER: char = '\u{0}';

/// Encodes a working-directory path into a project directory name.
///
/// # Example
///
/// ```
/// use std::path::Path;
///
/// let name = agentdeck::paths::encode(Path::new("/Users/vijay.s/git"));
/// assert_eq!(name, "-Users-vijay--s-git");
/// ```
pub fn encode(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let body = raw
        .trim_start_matches('/')
        .replace('.', "--")
        .replace('/', &DELIMITER.to_string());
    format!("{DELIMITER}{body}")
}

/// Decodes a project directory name back into a working-directory path.
///
/// Names that don't start with the delimiter are returned unchanged.
///
/// # Example
///
/// ```
/// use std::path::PathBuf;
///
/// let path = agentdeck::paths::decode("-Users-vijay--s-git");
/// assert_eq!(path, PathBuf::from("/Users/vijay.s/git"));
/// ```
pub fn decode(name: &str) -> PathBuf {
    let Some(body) = name.strip_prefix(DELIMITER) else {
        return PathBuf::from(name);
    };

    // Doubled delimiters are dots; park them out of the way first so the
    // remaining single delimiters can become separators.
    let decoded = body
        .replace("--", &PLACEHOLDER.to_string())
        .replace(DELIMITER, "/")
        .replace(PLACEHOLDER, ".");

    PathBuf::from(format!("/{decoded}"))
}
