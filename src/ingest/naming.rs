//! File naming helpers: which files are scans, and how people expect them sorted

use std::cmp::Ordering;
use std::path::Path;

/// Extensions the scanner produces (compared case-insensitively)
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tiff", "tif"];

/// Whether `path` looks like a scanned image
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// Hidden entries (`.name`) are work-in-progress and never shown
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    Number(u64),
    Text(String),
}

/// Split a name into digit / non-digit runs so `page2` sorts before `page10`
fn natural_key(name: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;

    for c in name.chars() {
        let is_digit = c.is_ascii_digit();
        if !current.is_empty() && is_digit != in_digits {
            chunks.push(make_chunk(&current, in_digits));
            current.clear();
        }
        in_digits = is_digit;
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(make_chunk(&current, in_digits));
    }
    chunks
}

fn make_chunk(run: &str, digits: bool) -> Chunk {
    if digits {
        Chunk::Number(run.parse().unwrap_or(u64::MAX))
    } else {
        Chunk::Text(run.to_lowercase())
    }
}

/// Compare two paths by file name in natural order
pub fn natural_cmp(a: &Path, b: &Path) -> Ordering {
    let name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    natural_key(&name(a)).cmp(&natural_key(&name(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_is_image() {
        assert!(is_image(Path::new("/scans/0001.JPG")));
        assert!(is_image(Path::new("page.tiff")));
        assert!(!is_image(Path::new("notes.txt")));
        assert!(!is_image(Path::new("README")));
    }

    #[test]
    fn test_natural_order() {
        let mut files: Vec<PathBuf> = ["scan10.jpg", "scan2.jpg", "Scan1.jpg", "scan2a.jpg"]
            .iter()
            .map(PathBuf::from)
            .collect();
        files.sort_by(|a, b| natural_cmp(a, b));

        let names: Vec<_> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(names, ["Scan1.jpg", "scan2.jpg", "scan2a.jpg", "scan10.jpg"]);
    }

    #[test]
    fn test_hidden() {
        assert!(is_hidden(Path::new("/staging/.BOOK-1.partial-42")));
        assert!(!is_hidden(Path::new("/staging/BOOK-1")));
    }
}
