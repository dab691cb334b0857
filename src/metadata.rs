use chrono::{DateTime, NaiveDateTime, Utc};
use exif::{In, Tag, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Best-effort metadata pulled from a photo's EXIF block.
#[derive(Debug, Clone, Default)]
pub struct PhotoMetadata {
    pub geo: Option<GeoPoint>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// Extraction never fails outward; anything unreadable just yields empty
/// metadata.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> PhotoMetadata;
}

pub struct ExifExtractor;

impl MetadataExtractor for ExifExtractor {
    fn extract(&self, path: &Path) -> PhotoMetadata {
        match read_exif(path) {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %path.display(),
                    "no usable exif data"
                );
                PhotoMetadata::default()
            }
        }
    }
}

fn read_exif(path: &Path) -> anyhow::Result<PhotoMetadata> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader)?;
    Ok(PhotoMetadata {
        geo: gps_coordinates(&exif),
        taken_at: capture_timestamp(&exif),
    })
}

fn gps_coordinates(exif: &exif::Exif) -> Option<GeoPoint> {
    let lat = signed_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, 'S')?;
    let lon = signed_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, 'W')?;
    Some(GeoPoint { lat, lon })
}

fn signed_coordinate(
    exif: &exif::Exif,
    value_tag: Tag,
    ref_tag: Tag,
    negative_ref: char,
) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() != 3 {
        return None;
    }
    let decimal =
        parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;

    let ref_field = exif.get_field(ref_tag, In::PRIMARY)?;
    let Value::Ascii(refs) = &ref_field.value else {
        return None;
    };
    let reference = *refs.first()?.first()? as char;
    if reference == negative_ref {
        Some(-decimal)
    } else {
        Some(decimal)
    }
}

fn capture_timestamp(exif: &exif::Exif) -> Option<DateTime<Utc>> {
    let field = exif.get_field(Tag::DateTimeOriginal, In::PRIMARY)?;
    let Value::Ascii(values) = &field.value else {
        return None;
    };
    let raw = values.first()?;
    let text = std::str::from_utf8(raw).ok()?;
    NaiveDateTime::parse_from_str(text.trim(), EXIF_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Device id is the filename's leading token before the first `-`, e.g.
/// `CAM7` for `CAM7-20240101.jpg`.
pub fn device_id(filename: &str) -> &str {
    filename.split('-').next().unwrap_or(filename)
}
