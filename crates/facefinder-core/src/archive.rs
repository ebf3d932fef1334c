//! Zip export of matched photos.

use crate::types::CandidatePhoto;
use std::io::{Cursor, Seek, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// `detected_<1-based index>_<original filename>`
pub fn entry_name(position: usize, filename: &str) -> String {
    format!("detected_{}_{}", position + 1, filename)
}

/// Write one entry per photo, bytes unmodified. Returns the entry count.
pub fn write_archive<'a, W, I>(writer: W, photos: I) -> Result<usize, ArchiveError>
where
    W: Write + Seek,
    I: IntoIterator<Item = &'a CandidatePhoto>,
{
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    for (position, photo) in photos.into_iter().enumerate() {
        zip.start_file(entry_name(position, &photo.filename), options)?;
        zip.write_all(&photo.bytes)?;
        count += 1;
    }
    zip.finish()?;

    tracing::debug!(entries = count, "archive written");
    Ok(count)
}

/// In-memory variant of [`write_archive`].
pub fn archive_bytes<'a, I>(photos: I) -> Result<Vec<u8>, ArchiveError>
where
    I: IntoIterator<Item = &'a CandidatePhoto>,
{
    let mut buf = Cursor::new(Vec::new());
    write_archive(&mut buf, photos)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    #[test]
    fn test_entries_named_and_byte_identical() {
        let photos = vec![
            CandidatePhoto::new("beach.jpg", vec![0xFF, 0xD8, 0x01, 0x02]),
            CandidatePhoto::new("party.png", (0..=255).collect()),
            CandidatePhoto::new("beach.jpg", vec![9, 9, 9]),
        ];

        let bytes = archive_bytes(&photos).unwrap();
        let mut zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 3);

        for (i, photo) in photos.iter().enumerate() {
            let mut entry = zip.by_index(i).unwrap();
            assert_eq!(entry.name(), format!("detected_{}_{}", i + 1, photo.filename));
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            assert_eq!(content, &photo.bytes[..]);
        }
    }

    #[test]
    fn test_empty_archive() {
        let bytes = archive_bytes(std::iter::empty()).unwrap();
        let zip = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[test]
    fn test_entry_name() {
        assert_eq!(entry_name(0, "a.jpg"), "detected_1_a.jpg");
        assert_eq!(entry_name(9, "b c.png"), "detected_10_b c.png");
    }
}
