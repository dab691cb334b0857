use std::path::Path;

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Photo,
    Video,
}

/// Maps a filename to a supported content kind by extension, or `None` for
/// anything this relay does not forward.
pub fn classify(filename: &str) -> Option<FileKind> {
    let extension = Path::new(filename).extension()?.to_str()?.to_lowercase();
    if PHOTO_EXTENSIONS.contains(&extension.as_str()) {
        Some(FileKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        Some(FileKind::Video)
    } else {
        None
    }
}
