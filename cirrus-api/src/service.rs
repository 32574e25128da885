//! The API façade
//!
//! Every operation returns a fresh, idle [`Call`]. Nothing touches the
//! network until the call is executed, awaited or enqueued.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cirrus_core::{
    ApiError, ApiRequest, ApiResponse, ApiResult, Call, CallEnv, DataSink, DataSource,
    DownloadOptions, EntryId, FileLink, Lease, ProgressListener, ProgressTracker, RemoteEntry,
    RemoteFile, RemoteFolder, Transport, UserInfo, ROOT_FOLDER_ID,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::builder::{Builder, ServiceConfig};
use crate::cache::ResponseCache;
use crate::http::HttpClient;
use crate::protocol::{self, MetadataResponse, RecursiveDeleteResponse, UploadResponse};
use crate::transfer::{self, Deadlines};

/// Operation name of download calls
const DOWNLOAD: &str = "download";

/// Options for [`ApiService::create_file`]
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Modification time to record for the new file
    pub modified: Option<DateTime<Utc>>,
    pub listener: Option<Arc<dyn ProgressListener>>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("modified", &self.modified)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

struct ServiceInner {
    config: ServiceConfig,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
    lease: Mutex<Lease>,
    shut_down: AtomicBool,
}

impl ServiceInner {
    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.config.api_host, method)
    }

    fn deadlines(&self) -> Deadlines {
        Deadlines {
            read: self.config.read_timeout(),
            write: self.config.write_timeout(),
        }
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.config.cache {
            cache.clear();
        }
    }

    async fn prepare(&self, request: &mut ApiRequest) -> ApiResult<()> {
        request
            .headers
            .push(("User-Agent".to_string(), self.config.user_agent.clone()));
        self.config.authenticator.authenticate(request).await
    }

    async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        let read = self.config.read_timeout();
        let response = transfer::within(read, "response", self.transport.send(request)).await??;
        if !response.is_success() {
            return Err(ApiError::protocol(format!(
                "unexpected HTTP status {}",
                response.status
            )));
        }
        Ok(response)
    }

    /// Authenticate and send one JSON request. Cacheable answers are looked
    /// up and stored under the authenticated request, and only kept if no
    /// mutation cleared the cache while the request was in flight.
    async fn send_json(
        &self,
        mut request: ApiRequest,
        cache: Option<&ResponseCache>,
    ) -> ApiResult<Bytes> {
        self.prepare(&mut request).await?;
        let cached = cache.map(|cache| (cache, ResponseCache::key(&request), cache.generation()));
        if let Some((cache, key, _)) = &cached {
            if let Some(body) = cache.get(key) {
                tracing::debug!(method = request.endpoint(), "served from cache");
                return Ok(body);
            }
        }

        let response = self.send(request).await?;
        let body = transfer::read_body(response, self.config.read_timeout()).await?;
        protocol::check(&body)?;
        if let Some((cache, key, generation)) = cached {
            if !cache.put_if_current(key, body.clone(), generation) {
                tracing::debug!("cache cleared while in flight, answer not kept");
            }
        }
        Ok(body)
    }

    /// Run one JSON method: cache lookup, one re-authenticated retry on
    /// credential errors, cache upkeep.
    async fn execute(&self, request: ApiRequest) -> ApiResult<Bytes> {
        let method = request.endpoint().to_string();
        let cache = self
            .config
            .cache
            .as_deref()
            .filter(|_| protocol::is_cacheable(&method));

        tracing::debug!(%method, "sending request");
        let retry = request.try_clone();
        let mut result = self.send_json(request, cache).await;

        let rejected = matches!(&result, Err(e) if e.is_auth_error());
        if let (true, Some(retry)) = (rejected, retry) {
            if self.config.authenticator.refresh().await? {
                tracing::debug!(%method, "retrying with refreshed credentials");
                result = self.send_json(retry, cache).await;
            }
        }

        if protocol::is_mutating(&method) {
            self.invalidate_cache();
        }
        result
    }

    async fn upload<S: DataSource>(
        &self,
        folder_id: u64,
        name: String,
        mut source: S,
        options: UploadOptions,
    ) -> ApiResult<RemoteFile> {
        let length = source.content_length();
        let reader = source.open().await?;
        let (tx, body) = transfer::body_channel(length, "application/octet-stream");

        let mut request = ApiRequest::post(self.url(protocol::UPLOAD_FILE))
            .query("folderid", folder_id)
            .query("filename", &name)
            .query("nopartial", 1);
        if let Some(modified) = options.modified {
            request = request.query("mtime", modified.timestamp());
        }
        let mut request = request.body(body);
        self.prepare(&mut request).await?;

        tracing::debug!(folder_id, %name, ?length, "uploading");
        let mut tracker =
            ProgressTracker::new(options.listener, self.config.progress_threshold, length);
        let sent = transfer::send_upload(
            self.transport.as_ref(),
            request,
            reader,
            tx,
            &mut tracker,
            self.deadlines(),
        )
        .await;
        self.invalidate_cache();

        let response = sent?;
        if !response.is_success() {
            return Err(ApiError::protocol(format!(
                "unexpected HTTP status {}",
                response.status
            )));
        }
        let body = transfer::read_body(response, self.config.read_timeout()).await?;
        let parsed: UploadResponse = protocol::parse(&body)?;
        tracker.finish()?;

        parsed
            .metadata
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::protocol("upload answer without file metadata"))?
            .into_file()
    }

    /// Content hosts take signed links, no credentials.
    async fn open_url(&self, url: String) -> ApiResult<ApiResponse> {
        let request = ApiRequest::get(url).header("User-Agent", self.config.user_agent.clone());
        self.send(request).await
    }

    async fn download<S: DataSink>(
        &self,
        url: String,
        mut sink: S,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> ApiResult<S> {
        let response = self.open_url(url).await?;
        let mut tracker = ProgressTracker::new(
            listener,
            self.config.progress_threshold,
            response.content_length,
        );
        let total = transfer::download_into(
            response,
            &mut sink,
            &mut tracker,
            self.config.read_timeout(),
        )
        .await?;
        tracing::debug!(bytes = total, "download complete");
        Ok(sink)
    }
}

fn entry(body: Bytes) -> ApiResult<RemoteEntry> {
    Ok(protocol::parse::<MetadataResponse>(&body)?.metadata)
}

fn folder(body: Bytes) -> ApiResult<RemoteFolder> {
    entry(body)?.into_folder()
}

fn file(body: Bytes) -> ApiResult<RemoteFile> {
    entry(body)?.into_file()
}

fn guard_root(id: EntryId, action: &str) -> ApiResult<()> {
    if id == EntryId::Folder(ROOT_FOLDER_ID) {
        return Err(ApiError::invalid_argument(format!(
            "cannot {action} the root folder"
        )));
    }
    Ok(())
}

/// Remote storage client
///
/// Cheap to clone; clones are the same service. Services derived through
/// [`new_builder`](Self::new_builder) share the dispatcher, connection pool
/// and cache with this one unless the builder replaced them, so
/// [`shutdown`](Self::shutdown) closes the shared dispatcher for all of them.
#[derive(Clone)]
pub struct ApiService {
    inner: Arc<ServiceInner>,
}

impl ApiService {
    /// Builder with default settings.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(config: ServiceConfig, transport: Arc<dyn Transport>) -> Self {
        let lease = config.dispatcher.lease();
        Self {
            inner: Arc::new(ServiceInner {
                config,
                transport,
                token: CancellationToken::new(),
                lease: Mutex::new(lease),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Pool, dispatcher and cache of this service, for sharing.
    pub fn http_client(&self) -> HttpClient {
        self.inner.config.http_client()
    }

    /// Builder pre-populated with this service's configuration.
    pub fn new_builder(&self) -> Builder {
        Builder::from_config(&self.inner.config)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Cancel every call created by this service, close the shared
    /// dispatcher to new work, evict the cache and pooled connections and
    /// give up this service's dispatcher lease.
    ///
    /// Services sharing the dispatcher stop accepting work as well. The
    /// runtime itself goes away once the last lease is released.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(api_host = %self.inner.config.api_host, "shutting down api service");
        self.inner.token.cancel();
        self.inner.config.dispatcher.close();
        self.inner.invalidate_cache();
        self.inner.config.pool.evict_all();
        self.inner.lease.lock().release();
    }

    fn env(&self) -> CallEnv {
        CallEnv::new(self.inner.config.dispatcher.clone())
            .with_executor(self.inner.config.callback_executor.clone())
            .with_token(self.inner.token.clone())
            .with_owner(self.inner.clone())
    }

    fn request(&self, method: &str) -> ApiRequest {
        ApiRequest::get(self.inner.url(method))
    }

    fn json_call<T, F>(&self, method: &'static str, request: ApiRequest, parse: F) -> Call<T>
    where
        T: Send + 'static,
        F: FnOnce(Bytes) -> ApiResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        Call::new(method, &self.env(), move |_| async move {
            let body = inner.execute(request).await?;
            parse(body)
        })
    }

    fn copy_request(&self, id: EntryId, to_folder: u64, overwrite: bool) -> (&'static str, ApiRequest) {
        let (method, request) = match id {
            EntryId::Folder(folder_id) => (
                protocol::COPY_FOLDER,
                self.request(protocol::COPY_FOLDER).query("folderid", folder_id),
            ),
            EntryId::File(file_id) => (
                protocol::COPY_FILE,
                self.request(protocol::COPY_FILE).query("fileid", file_id),
            ),
        };
        let mut request = request.query("tofolderid", to_folder);
        if !overwrite {
            request = request.query("noover", 1);
        }
        (method, request)
    }

    fn move_request(&self, id: EntryId, to_folder: u64) -> (&'static str, ApiRequest) {
        match id {
            EntryId::Folder(folder_id) => (
                protocol::RENAME_FOLDER,
                self.request(protocol::RENAME_FOLDER)
                    .query("folderid", folder_id)
                    .query("tofolderid", to_folder),
            ),
            EntryId::File(file_id) => (
                protocol::RENAME_FILE,
                self.request(protocol::RENAME_FILE)
                    .query("fileid", file_id)
                    .query("tofolderid", to_folder),
            ),
        }
    }

    fn rename_request(&self, id: EntryId, name: &str) -> (&'static str, ApiRequest) {
        match id {
            EntryId::Folder(folder_id) => (
                protocol::RENAME_FOLDER,
                self.request(protocol::RENAME_FOLDER)
                    .query("folderid", folder_id)
                    .query("toname", name),
            ),
            EntryId::File(file_id) => (
                protocol::RENAME_FILE,
                self.request(protocol::RENAME_FILE)
                    .query("fileid", file_id)
                    .query("toname", name),
            ),
        }
    }

    fn delete_request(&self, id: EntryId, recursive: bool) -> (&'static str, ApiRequest) {
        match id {
            EntryId::Folder(folder_id) => {
                let method = if recursive {
                    protocol::DELETE_FOLDER_RECURSIVE
                } else {
                    protocol::DELETE_FOLDER
                };
                (method, self.request(method).query("folderid", folder_id))
            }
            EntryId::File(file_id) => (
                protocol::DELETE_FILE,
                self.request(protocol::DELETE_FILE).query("fileid", file_id),
            ),
        }
    }

    fn delete_call(&self, id: EntryId, recursive: bool) -> Call<bool> {
        let (method, request) = self.delete_request(id, recursive);
        self.json_call(method, request, move |body| {
            if method == protocol::DELETE_FOLDER_RECURSIVE {
                let counts: RecursiveDeleteResponse = protocol::parse(&body)?;
                tracing::debug!(
                    files = counts.deleted_files,
                    folders = counts.deleted_folders,
                    "folder deleted recursively"
                );
            }
            Ok(true)
        })
    }

    pub fn list_folder(&self, folder_id: u64, recursive: bool) -> Call<RemoteFolder> {
        let mut request = self
            .request(protocol::LIST_FOLDER)
            .query("folderid", folder_id);
        if recursive {
            request = request.query("recursive", 1);
        }
        self.json_call(protocol::LIST_FOLDER, request, folder)
    }

    /// Direct children of `parent`, files and folders, as currently stored
    /// remotely. Empty for an empty folder.
    pub fn list_files(&self, parent: &RemoteFolder) -> Call<Vec<RemoteEntry>> {
        let request = self
            .request(protocol::LIST_FOLDER)
            .query("folderid", parent.folder_id);
        self.json_call(protocol::LIST_FOLDER, request, |body| {
            Ok(folder(body)?.children)
        })
    }

    pub fn create_folder(&self, parent_id: u64, name: &str) -> ApiResult<Call<RemoteFolder>> {
        protocol::validate_name(name)?;
        let request = self
            .request(protocol::CREATE_FOLDER)
            .query("folderid", parent_id)
            .query("name", name);
        Ok(self.json_call(protocol::CREATE_FOLDER, request, folder))
    }

    /// Delete a folder. Without `recursive` the folder has to be empty.
    pub fn delete_folder(&self, folder_id: u64, recursive: bool) -> ApiResult<Call<bool>> {
        let id = EntryId::Folder(folder_id);
        guard_root(id, "delete")?;
        Ok(self.delete_call(id, recursive))
    }

    pub fn rename_folder(&self, folder_id: u64, name: &str) -> ApiResult<Call<RemoteFolder>> {
        let id = EntryId::Folder(folder_id);
        guard_root(id, "rename")?;
        protocol::validate_name(name)?;
        let (method, request) = self.rename_request(id, name);
        Ok(self.json_call(method, request, folder))
    }

    pub fn move_folder(&self, folder_id: u64, to_folder: u64) -> ApiResult<Call<RemoteFolder>> {
        let id = EntryId::Folder(folder_id);
        guard_root(id, "move")?;
        let (method, request) = self.move_request(id, to_folder);
        Ok(self.json_call(method, request, folder))
    }

    pub fn copy_folder(&self, folder_id: u64, to_folder: u64, overwrite: bool) -> Call<RemoteFolder> {
        let (method, request) = self.copy_request(EntryId::Folder(folder_id), to_folder, overwrite);
        self.json_call(method, request, folder)
    }

    /// Upload `source` as a new file named `name` in `folder_id`.
    pub fn create_file<S>(
        &self,
        folder_id: u64,
        name: &str,
        source: S,
        options: UploadOptions,
    ) -> ApiResult<Call<RemoteFile>>
    where
        S: DataSource + 'static,
    {
        protocol::validate_name(name)?;
        let inner = self.inner.clone();
        let name = name.to_string();
        Ok(Call::new(protocol::UPLOAD_FILE, &self.env(), move |_| async move {
            inner.upload(folder_id, name, source, options).await
        }))
    }

    pub fn delete_file(&self, file_id: u64) -> Call<bool> {
        self.delete_call(EntryId::File(file_id), false)
    }

    pub fn create_file_link(&self, file_id: u64, options: DownloadOptions) -> Call<FileLink> {
        let mut request = self
            .request(protocol::GET_FILE_LINK)
            .query("fileid", file_id);
        for (key, value) in protocol::link_params(&options) {
            request = request.query(key, value);
        }
        self.json_call(protocol::GET_FILE_LINK, request, |body| protocol::parse(&body))
    }

    /// Stream the file behind `link` into `sink`. The sink is handed back
    /// once everything was written and the length checked out.
    pub fn download<S>(
        &self,
        link: &FileLink,
        sink: S,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> ApiResult<Call<S>>
    where
        S: DataSink + 'static,
    {
        let url = link
            .best_url()
            .ok_or_else(|| ApiError::invalid_argument("file link has no hosts"))?;
        let inner = self.inner.clone();
        Ok(Call::new(DOWNLOAD, &self.env(), move |_| async move {
            inner.download(url, sink, listener).await
        }))
    }

    /// Open the file behind `link` for streaming. Dropping the response
    /// body closes the connection.
    pub fn open(&self, link: &FileLink) -> ApiResult<Call<ApiResponse>> {
        let url = link
            .best_url()
            .ok_or_else(|| ApiError::invalid_argument("file link has no hosts"))?;
        let inner = self.inner.clone();
        Ok(Call::new(DOWNLOAD, &self.env(), move |_| async move {
            let mut response = inner.open_url(url).await?;
            response.body = transfer::with_read_deadline(response.body, inner.config.read_timeout());
            Ok(response)
        }))
    }

    /// Fetch a link for `file_id` and download it into `sink`.
    pub fn download_file<S>(
        &self,
        file_id: u64,
        sink: S,
        listener: Option<Arc<dyn ProgressListener>>,
    ) -> Call<S>
    where
        S: DataSink + 'static,
    {
        let inner = self.inner.clone();
        let request = self
            .request(protocol::GET_FILE_LINK)
            .query("fileid", file_id);
        Call::new(DOWNLOAD, &self.env(), move |_| async move {
            let body = inner.execute(request).await?;
            let link: FileLink = protocol::parse(&body)?;
            let url = link
                .best_url()
                .ok_or_else(|| ApiError::protocol("file link without hosts"))?;
            inner.download(url, sink, listener).await
        })
    }

    pub fn copy_file(&self, file_id: u64, to_folder: u64, overwrite: bool) -> Call<RemoteFile> {
        let (method, request) = self.copy_request(EntryId::File(file_id), to_folder, overwrite);
        self.json_call(method, request, file)
    }

    pub fn move_file(&self, file_id: u64, to_folder: u64) -> Call<RemoteFile> {
        let (method, request) = self.move_request(EntryId::File(file_id), to_folder);
        self.json_call(method, request, file)
    }

    pub fn rename_file(&self, file_id: u64, name: &str) -> ApiResult<Call<RemoteFile>> {
        protocol::validate_name(name)?;
        let (method, request) = self.rename_request(EntryId::File(file_id), name);
        Ok(self.json_call(method, request, file))
    }

    pub fn copy(&self, id: EntryId, to_folder: u64, overwrite: bool) -> Call<RemoteEntry> {
        let (method, request) = self.copy_request(id, to_folder, overwrite);
        self.json_call(method, request, entry)
    }

    pub fn move_entry(&self, id: EntryId, to_folder: u64) -> ApiResult<Call<RemoteEntry>> {
        guard_root(id, "move")?;
        let (method, request) = self.move_request(id, to_folder);
        Ok(self.json_call(method, request, entry))
    }

    /// Delete a file or an empty folder. Use
    /// [`delete_folder`](Self::delete_folder) with `recursive` for a folder
    /// tree.
    pub fn delete(&self, id: EntryId) -> ApiResult<Call<bool>> {
        guard_root(id, "delete")?;
        Ok(self.delete_call(id, false))
    }

    pub fn rename(&self, id: EntryId, name: &str) -> ApiResult<Call<RemoteEntry>> {
        guard_root(id, "rename")?;
        protocol::validate_name(name)?;
        let (method, request) = self.rename_request(id, name);
        Ok(self.json_call(method, request, entry))
    }

    pub fn user_info(&self) -> Call<UserInfo> {
        let request = self.request(protocol::USER_INFO);
        self.json_call(protocol::USER_INFO, request, |body| protocol::parse(&body))
    }
}

impl fmt::Debug for ApiService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiService")
            .field("config", &self.inner.config)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
