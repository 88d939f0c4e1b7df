//! Fixed 128-byte ID3v1 trailing tag builder.
//!
//! Field layout matches the original implementation's `struct ID3v1`
//! (`"TAG"` + 30/30/30/4/28/1/1/1-byte fields) exactly, so the tail-read
//! shortcut (`tcache_core::reader`) can serve byte-identical tags before the
//! full encode completes.

const TAG: &[u8; 3] = b"TAG";
const TITLE_LEN: usize = 30;
const ARTIST_LEN: usize = 30;
const ALBUM_LEN: usize = 30;
const YEAR_LEN: usize = 4;
const COMMENT_LEN: usize = 28;

pub const ID3V1_TAG_LENGTH: usize = 128;

/// Builder for the fixed ID3v1 tag layout.
#[derive(Debug, Clone, Default)]
pub struct Id3v1Tag {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub year: String,
    pub comment: String,
    pub track_no: u8,
    pub genre: u8,
}

impl Id3v1Tag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the 128-byte wire form. Longer fields are truncated at the
    /// byte boundary; shorter ones are zero-padded, matching a
    /// zero-initialized `struct ID3v1`.
    pub fn render(&self) -> [u8; ID3V1_TAG_LENGTH] {
        let mut buf = [0u8; ID3V1_TAG_LENGTH];
        let mut off = 0;
        buf[off..off + 3].copy_from_slice(TAG);
        off += 3;
        write_field(&mut buf, &mut off, &self.title, TITLE_LEN);
        write_field(&mut buf, &mut off, &self.artist, ARTIST_LEN);
        write_field(&mut buf, &mut off, &self.album, ALBUM_LEN);
        write_field(&mut buf, &mut off, &self.year, YEAR_LEN);
        write_field(&mut buf, &mut off, &self.comment, COMMENT_LEN);
        buf[off] = 0; // m_bPad, must be '\0'
        off += 1;
        buf[off] = self.track_no;
        off += 1;
        buf[off] = self.genre;
        off += 1;
        debug_assert_eq!(off, ID3V1_TAG_LENGTH);
        buf
    }
}

fn write_field(buf: &mut [u8], off: &mut usize, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    buf[*off..*off + n].copy_from_slice(&bytes[..n]);
    *off += width;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fixed_length_with_tag_prefix() {
        let tag = Id3v1Tag {
            title: "Song".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            year: "2024".into(),
            comment: "tcache".into(),
            track_no: 1,
            genre: 12,
        };
        let rendered = tag.render();
        assert_eq!(rendered.len(), ID3V1_TAG_LENGTH);
        assert_eq!(&rendered[0..3], b"TAG");
        assert_eq!(&rendered[3..7], b"Song");
        assert_eq!(rendered[125], 0); // pad
        assert_eq!(rendered[126], 1); // track_no
        assert_eq!(rendered[127], 12); // genre
    }

    #[test]
    fn truncates_oversized_fields_without_overrunning_neighbors() {
        let tag = Id3v1Tag {
            title: "x".repeat(50),
            ..Id3v1Tag::new()
        };
        let rendered = tag.render();
        // Artist field starts right after the 30-byte title slot.
        assert_eq!(&rendered[33..63], [0u8; 30]);
    }
}
