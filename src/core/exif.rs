use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Reader, Tag, Value};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

/// EXIF orientation tag (1..=8). Anything else is treated as upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90,
    Transverse,
    Rotate270,
}

impl Orientation {
    pub fn from_exif(value: u32) -> Self {
        match value {
            2 => Orientation::FlipHorizontal,
            3 => Orientation::Rotate180,
            4 => Orientation::FlipVertical,
            5 => Orientation::Transpose,
            6 => Orientation::Rotate90,
            7 => Orientation::Transverse,
            8 => Orientation::Rotate270,
            _ => Orientation::Normal,
        }
    }
}

/// Reads the few EXIF fields the engine needs
#[derive(Debug, Clone, Default)]
pub struct ExifService;

impl ExifService {
    pub fn new() -> Self {
        Self
    }

    /// Orientation from an in-memory file. Missing or unreadable EXIF means upright.
    pub fn orientation_from_bytes(&self, bytes: &[u8]) -> Orientation {
        let mut cursor = Cursor::new(bytes);
        let exif_reader = match Reader::new().read_from_container(&mut cursor) {
            Ok(reader) => reader,
            Err(_) => return Orientation::Normal,
        };

        exif_reader
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .map(Orientation::from_exif)
            .unwrap_or(Orientation::Normal)
    }

    /// Capture date from DateTimeOriginal, falling back to DateTime
    pub fn capture_date(&self, file_path: &Path) -> Option<DateTime<Utc>> {
        let file = File::open(file_path).ok()?;
        let mut buf_reader = BufReader::new(file);
        let exif_reader = Reader::new().read_from_container(&mut buf_reader).ok()?;

        let field = exif_reader
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .or_else(|| exif_reader.get_field(Tag::DateTime, In::PRIMARY))?;

        match &field.value {
            Value::Ascii(vec) if !vec.is_empty() => {
                let raw = String::from_utf8_lossy(&vec[0]);
                parse_exif_datetime(raw.trim())
            }
            _ => None,
        }
    }
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS", interpreted as UTC
fn parse_exif_datetime(datetime_str: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(datetime_str, "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
