// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI command implementations

use chrono::{DateTime, Utc};
use cirrus_api::{ApiService, UploadOptions};
use cirrus_core::{
    format_timestamp, ApiError, ApiResult, DataSource, DownloadOptions, EntryId, FileSink,
    FileSource, ProgressListener, RemoteEntry, RemoteFolder,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use tabled::{Table, Tabled};

fn parse_entry(id: &str) -> ApiResult<EntryId> {
    id.parse()
}

fn format_time(dt: Option<DateTime<Utc>>) -> String {
    dt.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_size(size: u64, human: bool) -> String {
    if human {
        bytesize::ByteSize(size).to_string()
    } else {
        size.to_string()
    }
}

fn format_kind(entry: &RemoteEntry) -> String {
    match entry {
        RemoteEntry::Folder(_) => style("d").cyan().to_string(),
        RemoteEntry::File(_) => "-".to_string(),
    }
}

fn describe(entry: &RemoteEntry) -> String {
    format!("{} ({})", entry.name(), entry.id())
}

/// Progress bar fed by transfer callbacks. The length is picked up from the
/// first report when it was not known up front.
fn progress_bar(total: Option<u64>) -> ApiResult<ProgressBar> {
    let bar = match total {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::no_length(),
    };
    let template = "{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})";
    let bar_style = ProgressStyle::with_template(template)
        .map_err(|e| ApiError::invalid_argument(format!("progress template: {e}")))?
        .progress_chars("=> ");
    bar.set_style(bar_style);
    Ok(bar)
}

fn listener(bar: &ProgressBar) -> Arc<dyn ProgressListener> {
    let bar = bar.clone();
    Arc::new(move |done: u64, total: Option<u64>| {
        if let Some(total) = total {
            if bar.length() != Some(total) {
                bar.set_length(total);
            }
        }
        bar.set_position(done);
    })
}

#[derive(Tabled)]
struct LsEntry {
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Id")]
    id: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
    #[tabled(rename = "Name")]
    name: String,
}

fn collect_rows(folder: &RemoteFolder, prefix: &str, human: bool, rows: &mut Vec<LsEntry>) {
    for child in &folder.children {
        let name = format!("{prefix}{}", child.name());
        let size = match child {
            RemoteEntry::File(file) => format_size(file.size, human),
            RemoteEntry::Folder(_) => "-".to_string(),
        };
        rows.push(LsEntry {
            kind: format_kind(child),
            id: child.id().to_string(),
            size,
            modified: format_time(child.modified()),
            name: name.clone(),
        });
        if let RemoteEntry::Folder(sub) = child {
            collect_rows(sub, &format!("{name}/"), human, rows);
        }
    }
}

/// List folder contents
pub async fn ls(
    service: &ApiService,
    folder_id: u64,
    long: bool,
    human: bool,
    recursive: bool,
) -> ApiResult<()> {
    tracing::info!(folder_id, recursive, "listing folder");
    let folder = service.list_folder(folder_id, recursive).execute_async().await?;

    if folder.children.is_empty() {
        println!("(empty folder)");
        return Ok(());
    }

    if long {
        let mut rows = Vec::new();
        collect_rows(&folder, "", human, &mut rows);
        println!("{}", Table::new(rows));
    } else {
        for child in &folder.children {
            match child {
                RemoteEntry::Folder(_) => println!("{}/", style(child.name()).cyan()),
                RemoteEntry::File(_) => println!("{}", child.name()),
            }
        }
    }
    Ok(())
}

/// Create a folder
pub async fn mkdir(service: &ApiService, parent: u64, name: &str) -> ApiResult<()> {
    let folder = service.create_folder(parent, name)?.execute_async().await?;
    println!("Created {} ({})", folder.name, folder.id());
    Ok(())
}

/// Remove files or folders
pub async fn rm(service: &ApiService, entries: &[String], recursive: bool) -> ApiResult<()> {
    for raw in entries {
        let id = parse_entry(raw)?;
        let call = match id {
            EntryId::Folder(folder_id) => service.delete_folder(folder_id, recursive)?,
            EntryId::File(file_id) => service.delete_file(file_id),
        };
        call.execute_async().await?;
        println!("Removed {id}");
    }
    Ok(())
}

/// Move an entry into another folder
pub async fn mv(service: &ApiService, entry: &str, to: u64) -> ApiResult<()> {
    let moved = service
        .move_entry(parse_entry(entry)?, to)?
        .execute_async()
        .await?;
    println!("Moved {} -> d{to}", describe(&moved));
    Ok(())
}

/// Copy an entry into another folder
pub async fn cp(service: &ApiService, entry: &str, to: u64, force: bool) -> ApiResult<()> {
    let copied = service
        .copy(parse_entry(entry)?, to, force)
        .execute_async()
        .await?;
    println!("Copied {entry} -> {}", describe(&copied));
    Ok(())
}

/// Rename an entry
pub async fn rename(service: &ApiService, entry: &str, name: &str) -> ApiResult<()> {
    let renamed = service
        .rename(parse_entry(entry)?, name)?
        .execute_async()
        .await?;
    println!("Renamed {entry} -> {}", renamed.name());
    Ok(())
}

/// Upload a local file
pub async fn put(
    service: &ApiService,
    local: &Path,
    folder: u64,
    name: Option<&str>,
) -> ApiResult<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ApiError::invalid_argument(format!("no file name in {}", local.display()))
            })?,
    };
    let source = FileSource::new(local)?;
    let size = source.content_length();

    let bar = progress_bar(size)?;
    let options = UploadOptions::new().listener(listener(&bar));
    let result = service
        .create_file(folder, &name, source, options)?
        .execute_async()
        .await;
    match result {
        Ok(file) => {
            bar.finish();
            println!(
                "Uploaded {} ({}, {})",
                file.name,
                file.id(),
                bytesize::ByteSize(file.size)
            );
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

/// Download a file
pub async fn get(service: &ApiService, file: u64, local: &Path) -> ApiResult<()> {
    let bar = progress_bar(None)?;
    let result = service
        .download_file(file, FileSink::new(local), Some(listener(&bar)))
        .execute_async()
        .await;
    match result {
        Ok(sink) => {
            bar.finish();
            println!("Saved {}", sink.path().display());
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

/// Print a download link
pub async fn link(service: &ApiService, file: u64, download: bool) -> ApiResult<()> {
    let options = DownloadOptions::new().force_download(download);
    let link = service.create_file_link(file, options).execute_async().await?;
    for url in link.urls() {
        println!("{url}");
    }
    println!(
        "{} {}",
        style("expires").dim(),
        format_timestamp(&link.expires)
    );
    Ok(())
}

/// Show account information
pub async fn whoami(service: &ApiService) -> ApiResult<()> {
    let info = service.user_info().execute_async().await?;
    let verified = if info.email_verified {
        style("verified").green()
    } else {
        style("unverified").red()
    };
    println!("{} ({verified})", info.email);
    println!("  User id: {}", info.user_id);
    println!("  Plan:    {}", if info.premium { "premium" } else { "free" });

    let pct = if info.quota > 0 {
        info.used_quota as f64 / info.quota as f64 * 100.0
    } else {
        0.0
    };
    println!("  Quota:   {}", bytesize::ByteSize(info.quota));
    println!("  Used:    {} ({pct:.1}%)", bytesize::ByteSize(info.used_quota));
    println!("  Free:    {}", bytesize::ByteSize(info.free_quota()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::RemoteFile;

    fn file(name: &str, size: u64) -> RemoteEntry {
        RemoteEntry::File(RemoteFile {
            file_id: 9,
            parent_folder_id: 1,
            name: name.into(),
            size,
            content_type: None,
            hash: None,
            created: None,
            modified: None,
        })
    }

    fn folder(id: u64, name: &str, children: Vec<RemoteEntry>) -> RemoteFolder {
        RemoteFolder {
            folder_id: id,
            parent_folder_id: Some(0),
            name: name.into(),
            created: None,
            modified: None,
            children,
        }
    }

    #[test]
    fn test_recursive_rows_use_paths() {
        let inner = folder(2, "photos", vec![file("cat.jpg", 2048)]);
        let root = folder(
            0,
            "/",
            vec![RemoteEntry::Folder(inner), file("notes.txt", 12)],
        );

        let mut rows = Vec::new();
        collect_rows(&root, "", true, &mut rows);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["photos", "photos/cat.jpg", "notes.txt"]);
        assert_eq!(rows[0].id, "d2");
        assert_eq!(rows[0].size, "-");
        assert_eq!(rows[2].size, "12 B");
    }

    #[test]
    fn test_entry_ids_need_a_kind_prefix() {
        assert_eq!(parse_entry("f42").unwrap(), EntryId::File(42));
        assert_eq!(parse_entry("d0").unwrap(), EntryId::Folder(0));
        assert!(parse_entry("42").is_err());
    }

    #[test]
    fn test_raw_sizes() {
        assert_eq!(format_size(1536, false), "1536");
        assert_eq!(format_time(None), "-");
    }
}
