//! Metadata writing for staged files.
//!
//! MP3 files get an ID3v2.4 tag through `id3`, which also handles files
//! whose audio stream it does not understand. Every other container goes
//! through `lofty`, using the file's primary tag type.

use std::path::Path;

use id3::frame::{Picture as Id3Picture, PictureType as Id3PictureType};
use id3::{Tag as Id3Tag, TagLike, Version};
use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::picture::{Picture, PictureType};
use lofty::prelude::Accessor;
use lofty::tag::{Tag, TagType};
use tracing::{debug, warn};

use crate::error::{MetadataError, Result};
use crate::provider::{CoverArt, Tagger};
use crate::track::TrackTags;

/// Concrete [`Tagger`] backed by `id3` and `lofty`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioTagger;

impl AudioTagger {
    /// Create a tagger.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn tag_mp3(path: &Path, tags: &TrackTags, cover_art: Option<CoverArt>) -> Result<()> {
        let mut tag = match Id3Tag::read_from_path(path) {
            Ok(tag) => tag,
            Err(id3::Error {
                kind: id3::ErrorKind::NoTag,
                ..
            }) => Id3Tag::new(),
            Err(e) => {
                return Err(MetadataError::ReadFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        tag.set_title(tags.title.as_str());
        tag.set_artist(tags.artist.as_str());
        if let Some(album) = &tags.album {
            tag.set_album(album.as_str());
        }
        tag.set_genre(tags.genre.as_str());

        if let Some(cover) = cover_art {
            tag.remove_picture_by_type(Id3PictureType::CoverFront);
            tag.add_frame(Id3Picture {
                mime_type: cover.mime_type,
                picture_type: Id3PictureType::CoverFront,
                description: "Cover".to_string(),
                data: cover.data,
            });
        }

        tag.write_to_path(path, Version::Id3v24).map_err(|e| {
            MetadataError::WriteFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn tag_generic(path: &Path, tags: &TrackTags, cover_art: Option<CoverArt>) -> Result<()> {
        let mut tagged_file = lofty::read_from_path(path).map_err(|e| {
            if matches!(e.kind(), lofty::error::ErrorKind::UnknownFormat) {
                MetadataError::UnsupportedFormat {
                    path: path.to_path_buf(),
                }
            } else {
                MetadataError::ReadFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;

        let tag_type = tagged_file.primary_tag_type();
        if tagged_file.tag(tag_type).is_none() {
            tagged_file.insert_tag(Tag::new(tag_type));
        }
        let tag = tagged_file
            .tag_mut(tag_type)
            .ok_or_else(|| MetadataError::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;

        tag.set_title(tags.title.clone());
        tag.set_artist(tags.artist.clone());
        if let Some(album) = &tags.album {
            tag.set_album(album.clone());
        }
        tag.set_genre(tags.genre.clone());

        if let Some(cover) = cover_art {
            if supports_pictures(tag_type) {
                match Picture::from_reader(&mut cover.data.as_slice()) {
                    Ok(mut picture) => {
                        picture.set_pic_type(PictureType::CoverFront);
                        tag.remove_picture_type(PictureType::CoverFront);
                        tag.push_picture(picture);
                    }
                    Err(e) => warn!("Skipping unreadable cover art for {}: {}", path.display(), e),
                }
            } else {
                debug!(
                    "{:?} tags cannot hold pictures, skipping cover art for {}",
                    tag_type,
                    path.display()
                );
            }
        }

        tagged_file
            .save_to_path(path, WriteOptions::default())
            .map_err(|e| {
                MetadataError::WriteFailed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

impl Tagger for AudioTagger {
    fn apply_metadata(
        &self,
        path: &Path,
        tags: &TrackTags,
        cover_art: Option<CoverArt>,
    ) -> Result<()> {
        if !path.is_file() {
            return Err(MetadataError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let is_mp3 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));

        debug!("Tagging {} ({})", path.display(), if is_mp3 { "id3" } else { "lofty" });
        if is_mp3 {
            Self::tag_mp3(path, tags, cover_art)
        } else {
            Self::tag_generic(path, tags, cover_art)
        }
    }
}

/// Whether a tag format can carry embedded pictures.
const fn supports_pictures(tag_type: TagType) -> bool {
    !matches!(
        tag_type,
        TagType::RiffInfo | TagType::AiffText | TagType::Id3v1
    )
}
