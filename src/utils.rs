use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

/// Final non-empty path segment of the url, or a generated name when the
/// path has none (e.g. `https://host/`).
pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return filename.to_string();
            }
        }
    }

    // Fallback if no filename found in path
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Where a download of `url` lands inside `dir`.
pub fn destination_path(dir: &Path, url: &Url) -> PathBuf {
    dir.join(sanitize_filename(&get_filename_from_url(url)))
}

/// First of `path`, `stem_1.ext`, `stem_2.ext`, ... that is not in `taken`.
pub fn get_unique_filepath(path: PathBuf, taken: &HashSet<PathBuf>) -> PathBuf {
    if !taken.contains(&path) {
        return path;
    }
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let file_stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let new_filename = if extension.is_empty() {
            format!("{}_{}", file_stem, counter)
        } else {
            format!("{}_{}.{}", file_stem, counter, extension)
        };
        let candidate = dir.join(new_filename);
        if !taken.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// `<path>.part`, keeping the original extension in front, so `a.zip` becomes `a.zip.part`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut part = path.as_os_str().to_os_string();
    part.push(".part");
    PathBuf::from(part)
}
