//! Source drive connector.
//!
//! [`DriveSource`] is the seam the processor talks to; [`GoogleDriveClient`]
//! implements it against the Drive v3 REST API. Listing walks the folder
//! tree breadth-first, following `nextPageToken` until exhausted and
//! skipping trashed items. Cloud-native documents have no downloadable
//! bytes and are fetched through the export endpoint instead.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::gcp::GcpHttp;
use crate::models::{FileFormat, SourceFile};
use crate::retry::{with_retry, RetryPolicy};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const LIST_FIELDS: &str =
    "nextPageToken, files(id, name, mimeType, modifiedTime, md5Checksum, webViewLink)";

#[async_trait]
pub trait DriveSource: Send + Sync {
    /// Every non-folder file under `folder_id`, recursively, each id once.
    async fn list_files(&self, folder_id: &str) -> Result<Vec<SourceFile>>;

    /// Raw bytes of `file`, exported when `format` is cloud-native.
    async fn fetch_content(&self, file: &SourceFile, format: FileFormat) -> Result<Vec<u8>>;
}

pub struct GoogleDriveClient {
    http: GcpHttp,
    page_size: u32,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    modified_time: DateTime<Utc>,
    md5_checksum: Option<String>,
    #[serde(default)]
    web_view_link: String,
}

impl DriveFile {
    fn into_source_file(self, path: &str) -> SourceFile {
        SourceFile {
            id: self.id,
            name: self.name,
            modified_time: self.modified_time,
            content_hash: self.md5_checksum.map(|md5| format!("md5:{}", md5)),
            mime_type: self.mime_type,
            web_link: self.web_view_link,
            path: path.to_string(),
        }
    }
}

/// Breadth-first walk state: folders still to list and files found so far.
///
/// Shortcuts, shared drives and multi-parent items make the tree a graph,
/// so both folders and files are de-duplicated by id. A file keeps the path
/// of the first folder it was seen in.
#[derive(Default)]
struct ListingWalk {
    pending: VecDeque<(String, String)>,
    visited_folders: HashSet<String>,
    seen_files: HashSet<String>,
    files: Vec<SourceFile>,
}

impl ListingWalk {
    fn new(root_id: &str) -> Self {
        let mut walk = Self::default();
        walk.pending.push_back((root_id.to_string(), String::new()));
        walk
    }

    /// Next folder to list, skipping ones already listed.
    fn next_folder(&mut self) -> Option<(String, String)> {
        while let Some((id, path)) = self.pending.pop_front() {
            if self.visited_folders.insert(id.clone()) {
                return Some((id, path));
            }
        }
        None
    }

    fn add_page(&mut self, folder_path: &str, page: Vec<DriveFile>) {
        for file in page {
            if file.mime_type == FOLDER_MIME {
                let path = if folder_path.is_empty() {
                    file.name.clone()
                } else {
                    format!("{}/{}", folder_path, file.name)
                };
                self.pending.push_back((file.id, path));
            } else if self.seen_files.insert(file.id.clone()) {
                self.files.push(file.into_source_file(folder_path));
            }
        }
    }
}

impl GoogleDriveClient {
    pub fn new(http: GcpHttp, page_size: u32, retry: RetryPolicy) -> Self {
        Self {
            http,
            page_size,
            retry,
        }
    }

    async fn list_page(&self, folder_id: &str, page_token: Option<&str>) -> Result<FileList> {
        let mut query = vec![
            ("q", format!("'{}' in parents and trashed=false", folder_id)),
            ("pageSize", self.page_size.to_string()),
            ("fields", LIST_FIELDS.to_string()),
            ("supportsAllDrives", "true".to_string()),
            ("includeItemsFromAllDrives", "true".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        with_retry(&self.retry, "drive.files.list", || {
            self.http.get_json::<FileList>(DRIVE_API, &query)
        })
        .await
    }
}

#[async_trait]
impl DriveSource for GoogleDriveClient {
    async fn list_files(&self, folder_id: &str) -> Result<Vec<SourceFile>> {
        let mut walk = ListingWalk::new(folder_id);

        while let Some((folder, path)) = walk.next_folder() {
            let mut page_token: Option<String> = None;
            loop {
                let page = self.list_page(&folder, page_token.as_deref()).await?;
                walk.add_page(&path, page.files);
                match page.next_page_token {
                    Some(token) if !token.is_empty() => page_token = Some(token),
                    _ => break,
                }
            }
            debug!(folder = %folder, path = %path, total = walk.files.len(), "listed folder");
        }

        info!(folder_id, files = walk.files.len(), "drive listing complete");
        Ok(walk.files)
    }

    async fn fetch_content(&self, file: &SourceFile, format: FileFormat) -> Result<Vec<u8>> {
        match format.export_mime() {
            Some(export_mime) => {
                let url = format!("{}/{}/export", DRIVE_API, file.id);
                let query = [("mimeType", export_mime.to_string())];
                with_retry(&self.retry, "drive.files.export", || {
                    self.http.get_bytes(&url, &query)
                })
                .await
            }
            None => {
                let url = format!("{}/{}", DRIVE_API, file.id);
                let query = [
                    ("alt", "media".to_string()),
                    ("supportsAllDrives", "true".to_string()),
                ];
                with_retry(&self.retry, "drive.files.get", || {
                    self.http.get_bytes(&url, &query)
                })
                .await
            }
        }
    }
}
