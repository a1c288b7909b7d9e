//! Archiving a day's hourly aggregates to S3.

use crate::layout::DataLayout;
use crate::model::FeedKind;
use anyhow::{Context, Result};
use aws_sdk_s3::primitives::ByteStream;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Object key of one hourly file: `realtime/date=<d>/<Feed>/<HH>.json[.gz]`.
pub fn object_key(date: NaiveDate, feed: FeedKind, file_name: &str, gzip: bool) -> String {
    let key = format!("realtime/date={}/{}/{}", date.format("%Y-%m-%d"), feed, file_name);
    if gzip { format!("{key}.gz") } else { key }
}

/// Hourly files of one feed and day, sorted by hour.
pub fn hourly_files(layout: &DataLayout, date: NaiveDate, feed: FeedKind) -> Result<Vec<PathBuf>> {
    let dir = layout.hourly_dir(date, feed);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn gzip_bytes(contents: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents)?;
    Ok(encoder.finish()?)
}

/// Body and object key for one hourly file.
pub fn prepare_upload(
    path: &Path,
    date: NaiveDate,
    feed: FeedKind,
    gzip: bool,
) -> Result<(Vec<u8>, String)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no file name in {}", path.display()))?;
    let contents = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let body = if gzip { gzip_bytes(&contents)? } else { contents };
    Ok((body, object_key(date, feed, file_name, gzip)))
}

/// Uploads every hourly aggregate of `date` (both feeds) to `bucket`.
/// Returns the number of objects written.
#[tracing::instrument(skip(client, layout))]
pub async fn upload_day(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    layout: &DataLayout,
    date: NaiveDate,
    gzip: bool,
) -> Result<usize> {
    let mut upload_count = 0;

    for feed in [FeedKind::VehiclePositions, FeedKind::TripUpdates] {
        for path in hourly_files(layout, date, feed)? {
            let (body, key) = prepare_upload(&path, date, feed, gzip)?;
            let content_type = if gzip { "application/gzip" } else { "application/json" };

            client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .content_type(content_type)
                .send()
                .await
                .with_context(|| format!("uploading s3://{bucket}/{key}"))?;

            debug!(key = %key, "Object uploaded");
            upload_count += 1;
        }
    }

    info!(upload_count, "S3 upload complete");
    Ok(upload_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::env;
    use std::io::Read;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 12).unwrap()
    }

    #[test]
    fn test_object_keys() {
        assert_eq!(
            object_key(date(), FeedKind::TripUpdates, "07.json", false),
            "realtime/date=2025-12-12/TripUpdates/07.json"
        );
        assert_eq!(
            object_key(date(), FeedKind::VehiclePositions, "23.json", true),
            "realtime/date=2025-12-12/VehiclePositions/23.json.gz"
        );
    }

    #[test]
    fn test_prepare_gzipped_upload() {
        let root = env::temp_dir().join("metro_delay_upload_prepare");
        let _ = fs::remove_dir_all(&root);
        let layout = DataLayout::new(&root);
        let dir = layout.hourly_dir(date(), FeedKind::VehiclePositions);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("09.json"), b"{\"hour\": 9}").unwrap();
        fs::write(dir.join("08.json"), b"{\"hour\": 8}").unwrap();
        fs::write(dir.join("10.json.tmp"), b"partial").unwrap();

        let files = hourly_files(&layout, date(), FeedKind::VehiclePositions).unwrap();
        assert_eq!(files, vec![dir.join("08.json"), dir.join("09.json")]);
        assert!(hourly_files(&layout, date(), FeedKind::TripUpdates).unwrap().is_empty());

        let (body, key) = prepare_upload(&files[0], date(), FeedKind::VehiclePositions, true).unwrap();
        assert_eq!(key, "realtime/date=2025-12-12/VehiclePositions/08.json.gz");

        let mut decoded = String::new();
        GzDecoder::new(body.as_slice()).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "{\"hour\": 8}");

        fs::remove_dir_all(&root).unwrap();
    }
}
