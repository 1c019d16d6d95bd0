/// Longest file name, in characters, that [`sanitize_filename`] produces.
pub const MAX_FILENAME_CHARS: usize = 255;

const ILLEGAL_FILENAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Makes `name` legal as a Windows file name: every reserved character becomes
/// `_` and the result is cut to [`MAX_FILENAME_CHARS`] characters.
///
/// Other filesystems' rules (reserved device names, trailing dots) are not handled.
/// The cut counts characters, not bytes: on Linux (`NAME_MAX` = 255 bytes) a long
/// multi-byte title can still be too long to create.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if ILLEGAL_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .take(MAX_FILENAME_CHARS)
        .collect()
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}
