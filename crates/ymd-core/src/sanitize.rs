//! Path sanitization for constrained storage devices.
//!
//! Turns arbitrary provider metadata into path segments that are legal on
//! FAT32/exFAT/NTFS as well as POSIX filesystems, and bounded in length.
//! Every function here is pure: the same input, kind and limit always give
//! the same output, which placement relies on to detect collisions.
//!
//! Input is NFKD-normalized before anything else, so compatibility forms
//! such as fullwidth punctuation are caught by the character filter. Lengths
//! are counted in Unicode scalar values (`char`s) of the normalized text.

use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Placeholder used when nothing printable survives sanitization.
pub const PLACEHOLDER: &str = "Unknown";

/// Longest suffix after the last `.` that is still treated as an extension.
pub const MAX_EXTENSION_LENGTH: usize = 8;

/// Characters not allowed on FAT32/NTFS, plus ASCII control characters.
#[allow(clippy::expect_used)]
static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[<>:"/\\|?*\x00-\x1f\x7f]"#).expect("invalid-chars regex must compile")
});

#[allow(clippy::expect_used)]
static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex must compile"));

#[allow(clippy::expect_used)]
static MULTI_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("dash regex must compile"));

/// Device names Windows reserves regardless of extension.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// What the sanitized string will be used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// A directory name. The whole string is subject to truncation.
    Segment,
    /// A file name. A trailing extension survives truncation intact.
    Filename,
}

/// Make `raw` safe for use as a single path component of at most
/// `max_length` characters.
///
/// A `max_length` of zero is treated as one.
///
/// # Example
///
/// ```
/// use ymd_core::sanitize::{sanitize, SegmentKind};
///
/// assert_eq!(sanitize("AC/DC", SegmentKind::Segment, 80), "ACDC");
/// assert_eq!(sanitize("Rock & Roll.mp3", SegmentKind::Filename, 120), "Rock and Roll.mp3");
/// assert_eq!(sanitize("???", SegmentKind::Segment, 80), "Unknown");
/// ```
#[must_use]
pub fn sanitize(raw: &str, kind: SegmentKind, max_length: usize) -> String {
    let max_length = max_length.max(1);
    let cleaned = clean(raw);

    if kind == SegmentKind::Filename
        && let Some((stem, ext)) = split_extension(&cleaned)
        && ext.chars().count() + 1 < max_length
    {
        let budget = max_length - ext.chars().count() - 1;
        let stem = bounded(stem, budget);
        return format!("{}.{ext}", avoid_reserved(&stem, budget));
    }

    let segment = bounded(&cleaned, max_length);
    avoid_reserved(&segment, max_length)
}

/// Filename for the `counter`-th collision of `filename`: `stem (n).ext`.
///
/// The suffix and extension are kept whole; only the stem shrinks to stay
/// within `max_length`.
#[must_use]
pub fn with_disambiguator(filename: &str, counter: u32, max_length: usize) -> String {
    let max_length = max_length.max(1);
    let suffix = format!(" ({counter})");
    let (stem, ext) = match split_extension(filename) {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (filename, None),
    };

    let reserved = suffix.chars().count() + ext.map_or(0, |e| e.chars().count() + 1);
    let budget = max_length.saturating_sub(reserved);
    let stem = truncate_chars(stem, budget).trim_end_matches(['.', ' ']);

    let candidate = match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    truncate_chars(&candidate, max_length).to_string()
}

/// `stem` without a trailing " (n)" disambiguator.
#[must_use]
pub fn without_disambiguator(stem: &str) -> &str {
    stem.strip_suffix(')')
        .and_then(|s| s.rsplit_once(" ("))
        .filter(|(_, n)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .map_or(stem, |(base, _)| base)
}

/// Extension of a sanitized filename, if it has one that would be preserved.
#[must_use]
pub fn extension(filename: &str) -> Option<&str> {
    split_extension(filename).map(|(_, ext)| ext)
}

/// Strip illegal characters and normalize spacing.
fn clean(raw: &str) -> String {
    let normalized: String = raw.nfkd().collect();
    let name = INVALID_CHARS.replace_all(&normalized, "");
    let name = name.replace('&', "and");
    let name = MULTI_SPACE.replace_all(&name, " ");
    let name = MULTI_DASH.replace_all(name.trim(), "-");
    name.trim_matches(['.', ' ']).to_string()
}

/// Truncate, trim trailing dots and spaces, fall back to the placeholder.
fn bounded(name: &str, max_length: usize) -> String {
    let name = truncate_chars(name, max_length).trim_end_matches(['.', ' ']);
    if name.is_empty() {
        truncate_chars(PLACEHOLDER, max_length).to_string()
    } else {
        name.to_string()
    }
}

/// Rename Windows device names: `CON` becomes `CON_` (or `CO_` at the limit).
fn avoid_reserved(name: &str, max_length: usize) -> String {
    let base = name.split('.').next().unwrap_or(name);
    if !RESERVED_NAMES
        .iter()
        .any(|reserved| base.eq_ignore_ascii_case(reserved))
    {
        return name.to_string();
    }

    let rest = &name[base.len()..];
    if name.chars().count() < max_length {
        format!("{base}_{rest}")
    } else {
        let keep = base.chars().count().saturating_sub(1);
        format!("{}_{rest}", truncate_chars(base, keep))
    }
}

/// Split `stem.ext` when the extension is short and alphanumeric.
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let valid_ext = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LENGTH
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    let stem = stem.trim_end_matches(['.', ' ']);
    (valid_ext && !stem.is_empty()).then_some((stem, ext))
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn len(s: &str) -> usize {
        s.chars().count()
    }

    #[test]
    fn test_strips_illegal_characters() {
        assert_eq!(sanitize("AC/DC", SegmentKind::Segment, 80), "ACDC");
        assert_eq!(
            sanitize("What? <Live> \"2024\"", SegmentKind::Segment, 80),
            "What Live 2024"
        );
        assert_eq!(sanitize("a\u{0}b\tc\nd", SegmentKind::Segment, 80), "abcd");
        assert_eq!(sanitize("C:\\Music|Best*", SegmentKind::Segment, 80), "CMusicBest");
    }

    #[test]
    fn test_normalizes_spacing_and_symbols() {
        assert_eq!(
            sanitize("  Simon   &  Garfunkel ", SegmentKind::Segment, 80),
            "Simon and Garfunkel"
        );
        assert_eq!(sanitize("A -- B --- C", SegmentKind::Segment, 80), "A - B - C");
        assert_eq!(sanitize("...hidden. . ", SegmentKind::Segment, 80), "hidden");
    }

    #[test]
    fn test_empty_collapses_to_placeholder() {
        assert_eq!(sanitize("", SegmentKind::Segment, 80), "Unknown");
        assert_eq!(sanitize("?*<>", SegmentKind::Segment, 80), "Unknown");
        assert_eq!(sanitize(" . . ", SegmentKind::Filename, 80), "Unknown");
        assert_eq!(sanitize("", SegmentKind::Segment, 3), "Unk");
    }

    #[test]
    fn test_segment_truncation_trims_trailing_dots() {
        assert_eq!(sanitize("abcd. efgh", SegmentKind::Segment, 6), "abcd");
        assert_eq!(sanitize("Ünïcödé Ärtist", SegmentKind::Segment, 4), "U\u{308}ni");
    }

    #[test]
    fn test_compatibility_forms_are_decomposed() {
        assert_eq!(sanitize("Caf\u{e9}", SegmentKind::Segment, 80), "Cafe\u{301}");
        assert_eq!(sanitize("\u{fb01}re", SegmentKind::Segment, 80), "fire");
        assert_eq!(sanitize("What\u{ff1f}", SegmentKind::Segment, 80), "What");
        assert_eq!(
            sanitize("\u{ff21}\u{ff23}\u{ff0f}\u{ff24}\u{ff23}", SegmentKind::Segment, 80),
            "ACDC"
        );
    }

    #[test]
    fn test_filename_keeps_extension_when_truncated() {
        let long = format!("{}.flac", "x".repeat(300));
        let out = sanitize(&long, SegmentKind::Filename, 40);
        assert_eq!(len(&out), 40);
        assert!(out.ends_with(".flac"));
        assert_eq!(out, format!("{}.flac", "x".repeat(35)));
    }

    #[test]
    fn test_filename_without_valid_extension_is_a_segment() {
        assert_eq!(
            sanitize("Track.with spaces", SegmentKind::Filename, 120),
            "Track.with spaces"
        );
        assert_eq!(sanitize("abcdefghij", SegmentKind::Filename, 5), "abcde");
    }

    #[test]
    fn test_extension_longer_than_limit_truncates_whole_name() {
        let out = sanitize("song.mp3", SegmentKind::Filename, 3);
        assert_eq!(out, "son");
    }

    #[test]
    fn test_no_room_for_stem_truncates_whole_name() {
        assert_eq!(sanitize("song.mp3", SegmentKind::Filename, 4), "song");
        assert_eq!(sanitize("song.flac", SegmentKind::Filename, 5), "song");
        assert_eq!(sanitize("song.mp3", SegmentKind::Filename, 5), "s.mp3");
    }

    #[test]
    fn test_reserved_device_names() {
        assert_eq!(sanitize("CON", SegmentKind::Segment, 80), "CON_");
        assert_eq!(sanitize("nul", SegmentKind::Segment, 80), "nul_");
        assert_eq!(sanitize("com1.mp3", SegmentKind::Filename, 80), "com1_.mp3");
        assert_eq!(sanitize("AUX", SegmentKind::Segment, 3), "AU_");
        assert_eq!(sanitize("CONTROL", SegmentKind::Segment, 80), "CONTROL");
    }

    #[test]
    fn test_is_deterministic() {
        let raw = "Björk — Jóga (Live) / 1997";
        let a = sanitize(raw, SegmentKind::Filename, 24);
        let b = sanitize(raw, SegmentKind::Filename, 24);
        assert_eq!(a, b);
    }

    #[test]
    fn test_never_exceeds_bound() {
        let inputs = [
            "",
            "a",
            "CON",
            "\u{1F3B5}\u{1F3B6}\u{1F3B7} emoji title that is quite long indeed.m4a",
            "Artist - Title (feat. Someone Else) [Official Music Video] 4K Remaster.opus",
            "....",
            "name.toolongextension",
            "日本語のタイトル - アーティスト.mp3",
        ];
        for raw in inputs {
            for max in [1, 2, 5, 8, 16, 40, 120, 255] {
                for kind in [SegmentKind::Segment, SegmentKind::Filename] {
                    let out = sanitize(raw, kind, max);
                    assert!(len(&out) <= max, "{raw:?} {kind:?} {max} -> {out:?}");
                    assert!(!out.is_empty());
                    assert!(!out.ends_with(['.', ' ']));
                }
            }
        }
    }

    #[test]
    fn test_extension_preserved_for_any_title() {
        for max in [16, 32, 120] {
            let out = sanitize(&format!("{}.mp3", "Ä".repeat(500)), SegmentKind::Filename, max);
            assert!(out.ends_with(".mp3"));
            assert!(len(&out) <= max);
        }
    }

    #[test]
    fn test_disambiguator_suffix() {
        assert_eq!(
            with_disambiguator("Queen - Bohemian Rhapsody.mp3", 1, 120),
            "Queen - Bohemian Rhapsody (1).mp3"
        );
        assert_eq!(with_disambiguator("noext", 12, 120), "noext (12)");
    }

    #[test]
    fn test_disambiguator_respects_bound() {
        let name = format!("{}.m4a", "y".repeat(36));
        assert_eq!(len(&name), 40);
        let out = with_disambiguator(&name, 7, 40);
        assert_eq!(len(&out), 40);
        assert!(out.ends_with(" (7).m4a"));

        let out = with_disambiguator(&name, 999, 40);
        assert!(out.ends_with(" (999).m4a"));
        assert!(len(&out) <= 40);
    }

    #[test]
    fn test_without_disambiguator() {
        assert_eq!(without_disambiguator("Queen - What (1)"), "Queen - What");
        assert_eq!(without_disambiguator("Queen - What (999)"), "Queen - What");
        assert_eq!(without_disambiguator("Live (Remastered)"), "Live (Remastered)");
        assert_eq!(without_disambiguator("Song ()"), "Song ()");
        assert_eq!(without_disambiguator("Song"), "Song");
    }

    #[test]
    fn test_extension_helper() {
        assert_eq!(extension("a - b.opus"), Some("opus"));
        assert_eq!(extension("a - b"), None);
        assert_eq!(extension(".hidden"), None);
    }
}
