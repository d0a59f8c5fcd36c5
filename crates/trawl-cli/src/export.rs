//! Renders run results as JSON or CSV.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use trawl_core::models::{ExtractionResult, ItemRecord, ProfileRecord, Target};

/// Engagement counts that get their own CSV column; anything else lands
/// in `extra`.
const COUNT_COLUMNS: [&str; 3] = ["likes", "comments", "views"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    /// Pretty JSON array of results
    Json,
    /// One row per item, plus one per failed target
    Csv,
    /// One row per successfully extracted profile
    Profiles,
}

/// Writes `results` to `path`, or to stdout when `path` is `None`.
pub fn export(results: &[ExtractionResult], format: ExportFormat, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            write_results(results, format, BufWriter::new(file))
        }
        None => write_results(results, format, io::stdout().lock()),
    }
}

pub fn write_results<W: Write>(results: &[ExtractionResult], format: ExportFormat, mut writer: W) -> Result<()> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, results)?;
            writeln!(writer)?;
        }
        ExportFormat::Csv => write_items_csv(results, &mut writer)?,
        ExportFormat::Profiles => write_profiles_csv(results, &mut writer)?,
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ItemRow<'a> {
    source: &'a str,
    target: &'a str,
    username: &'a str,
    timestamp: Option<String>,
    caption: &'a str,
    url: &'a str,
    likes: Option<i64>,
    comments: Option<i64>,
    views: Option<i64>,
    extra: String,
    error: String,
}

impl<'a> ItemRow<'a> {
    fn empty(target: &'a Target, username: &'a str) -> Self {
        Self {
            source: target.source().as_str(),
            target: target.id(),
            username,
            timestamp: None,
            caption: "",
            url: "",
            likes: None,
            comments: None,
            views: None,
            extra: String::new(),
            error: String::new(),
        }
    }

    fn item(target: &'a Target, username: &'a str, item: &'a ItemRecord) -> Self {
        let mut extra: BTreeMap<&str, serde_json::Value> = item
            .extra_fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        for (key, count) in &item.engagement_counts {
            if !COUNT_COLUMNS.contains(&key.as_str()) {
                extra.insert(key.as_str(), (*count).into());
            }
        }

        Self {
            timestamp: item.timestamp.map(|ts| ts.to_rfc3339()),
            caption: &item.caption,
            url: &item.url,
            likes: item.engagement_counts.get("likes").copied(),
            comments: item.engagement_counts.get("comments").copied(),
            views: item.engagement_counts.get("views").copied(),
            extra: to_json_cell(&extra),
            ..Self::empty(target, username)
        }
    }
}

fn write_items_csv<W: Write>(results: &[ExtractionResult], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for result in results {
        match result {
            ExtractionResult::Success {
                target,
                profile,
                items,
                ..
            } => {
                if items.is_empty() {
                    csv.serialize(ItemRow::empty(target, &profile.username))?;
                }
                for item in items {
                    csv.serialize(ItemRow::item(target, &profile.username, item))?;
                }
            }
            ExtractionResult::Failure {
                target,
                kind,
                message,
                ..
            } => {
                csv.serialize(ItemRow {
                    error: format!("{kind}: {message}"),
                    ..ItemRow::empty(target, "")
                })?;
            }
        }
    }
    csv.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ProfileRow<'a> {
    source: &'a str,
    target: &'a str,
    username: &'a str,
    display_name: Option<&'a str>,
    followers: u64,
    following: u64,
    items: usize,
    scraped_at: String,
    extra: String,
}

impl<'a> ProfileRow<'a> {
    fn new(target: &'a Target, profile: &'a ProfileRecord, items: usize) -> Self {
        Self {
            source: target.source().as_str(),
            target: target.id(),
            username: &profile.username,
            display_name: profile.display_name.as_deref(),
            followers: profile.follower_count,
            following: profile.following_count,
            items,
            scraped_at: profile.scraped_at.to_rfc3339(),
            extra: to_json_cell(&profile.extra_metrics),
        }
    }
}

fn write_profiles_csv<W: Write>(results: &[ExtractionResult], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for result in results {
        if let ExtractionResult::Success {
            target,
            profile,
            items,
            ..
        } = result
        {
            csv.serialize(ProfileRow::new(target, profile, items.len()))?;
        }
    }
    csv.flush()?;
    Ok(())
}

fn to_json_cell<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_core::error::AppError;
    use trawl_core::models::{ExtractedData, Source};
    use trawl_core::testutil::sample_data;
    use uuid::Uuid;

    fn results() -> Vec<ExtractionResult> {
        let ig = Target::new(Source::Instagram, "nasa").unwrap();
        let mut data = sample_data("nasa", 2);
        data.items[0] = data.items[0].clone().with_count("shares", 7).with_field("is_video", true);

        let shop = Target::new(Source::Shopee, "777").unwrap();
        let empty = ExtractedData {
            profile: ProfileRecord::new("shop777").with_display_name("Shop"),
            items: Vec::new(),
        };

        let ghost = Target::new(Source::Instagram, "ghost").unwrap();
        vec![
            ExtractionResult::success(Uuid::new_v4(), ig, data, 1),
            ExtractionResult::success(Uuid::new_v4(), shop, empty, 1),
            ExtractionResult::failure(
                Uuid::new_v4(),
                ghost,
                &AppError::NotFound("no such user".into()),
                1,
            ),
        ]
    }

    fn render(format: ExportFormat) -> String {
        let mut out = Vec::new();
        write_results(&results(), format, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn items_csv_has_a_row_per_item_and_failure() {
        let csv = render(ExportFormat::Csv);
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "source", "target", "username", "timestamp", "caption", "url", "likes",
                "comments", "views", "extra", "error"
            ]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(&rows[0][0], "instagram");
        assert_eq!(&rows[0][6], "10");
        assert_eq!(&rows[0][8], "");
        assert_eq!(&rows[0][9], r#"{"is_video":true,"shares":7}"#);
        assert_eq!(&rows[2][2], "shop777");
        assert_eq!(&rows[2][5], "");
        assert_eq!(&rows[3][1], "ghost");
        assert_eq!(&rows[3][10], "permanent: Not found: no such user");
    }

    #[test]
    fn profiles_csv_skips_failures() {
        let csv = render(ExportFormat::Profiles);
        let mut reader = csv::Reader::from_reader(csv.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "nasa");
        assert_eq!(&rows[0][4], "1000");
        assert_eq!(&rows[0][6], "2");
        assert_eq!(&rows[1][3], "Shop");
        assert!(rows[0][8].contains("engagement_rate"));
    }

    #[test]
    fn json_is_an_array_tagged_by_outcome() {
        let json: serde_json::Value = serde_json::from_str(&render(ExportFormat::Json)).unwrap();
        let array = json.as_array().unwrap();
        assert_eq!(array.len(), 3);
        assert_eq!(array[0]["outcome"], "success");
        assert_eq!(array[2]["outcome"], "failure");
        assert_eq!(array[2]["kind"], "permanent");
    }

    #[test]
    fn export_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        export(&results(), ExportFormat::Profiles, Some(&path)).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("source,target,username"));
    }
}
