//! In-memory storage server speaking the JSON method protocol

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cirrus_api::ApiService;
use cirrus_core::{ApiRequest, ApiResponse, ApiResult, Transport};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HOST: &str = "https://api.fake.test";
pub const CONTENT_HOST: &str = "content.fake.test";
const DATE: &str = "Thu, 21 Mar 2013 18:31:45 +0000";
const LINK_EXPIRES: &str = "Sat, 24 Jul 2100 03:18:31 +0000";

struct Folder {
    name: String,
    parent: Option<u64>,
}

struct File {
    name: String,
    parent: u64,
    data: Bytes,
}

struct Store {
    next_id: u64,
    folders: BTreeMap<u64, Folder>,
    files: BTreeMap<u64, File>,
}

impl Store {
    fn new() -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(
            0,
            Folder {
                name: "/".to_string(),
                parent: None,
            },
        );
        Self {
            next_id: 100,
            folders,
            files: BTreeMap::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn name_taken(&self, parent: u64, name: &str) -> bool {
        self.folders
            .values()
            .any(|f| f.parent == Some(parent) && f.name == name)
            || self.files.values().any(|f| f.parent == parent && f.name == name)
    }

    fn child_folders(&self, id: u64) -> Vec<u64> {
        self.folders
            .iter()
            .filter(|(_, f)| f.parent == Some(id))
            .map(|(k, _)| *k)
            .collect()
    }

    fn child_files(&self, id: u64) -> Vec<u64> {
        self.files
            .iter()
            .filter(|(_, f)| f.parent == id)
            .map(|(k, _)| *k)
            .collect()
    }

    fn file_json(&self, id: u64) -> Value {
        let file = &self.files[&id];
        json!({
            "isfolder": false,
            "id": format!("f{id}"),
            "fileid": id,
            "parentfolderid": file.parent,
            "name": file.name,
            "size": file.data.len(),
            "contenttype": "application/octet-stream",
            "hash": id * 7919,
            "created": DATE,
            "modified": DATE,
        })
    }

    fn folder_json(&self, id: u64, depth: usize) -> Value {
        let folder = &self.folders[&id];
        let mut value = json!({
            "isfolder": true,
            "id": format!("d{id}"),
            "folderid": id,
            "name": folder.name,
            "created": DATE,
            "modified": DATE,
        });
        if let Some(parent) = folder.parent {
            value["parentfolderid"] = json!(parent);
        }
        if depth > 0 {
            let mut contents: Vec<Value> = self
                .child_folders(id)
                .into_iter()
                .map(|child| self.folder_json(child, depth - 1))
                .collect();
            contents.extend(self.child_files(id).into_iter().map(|f| self.file_json(f)));
            value["contents"] = Value::Array(contents);
        }
        value
    }

    fn remove_tree(&mut self, id: u64) -> (u64, u64) {
        let (mut files, mut folders) = (0, 1);
        for child in self.child_folders(id) {
            let (f, d) = self.remove_tree(child);
            files += f;
            folders += d;
        }
        for file in self.child_files(id) {
            self.files.remove(&file);
            files += 1;
        }
        self.folders.remove(&id);
        (files, folders)
    }

    fn copy_tree(&mut self, id: u64, into: u64) -> u64 {
        let copy = self.allocate();
        let name = self.folders[&id].name.clone();
        self.folders.insert(
            copy,
            Folder {
                name,
                parent: Some(into),
            },
        );
        for file in self.child_files(id) {
            let new_id = self.allocate();
            let source = &self.files[&file];
            let duplicate = File {
                name: source.name.clone(),
                parent: copy,
                data: source.data.clone(),
            };
            self.files.insert(new_id, duplicate);
        }
        for child in self.child_folders(id) {
            self.copy_tree(child, copy);
        }
        copy
    }
}

fn error(code: u32, message: &str) -> Value {
    json!({ "result": code, "error": message })
}

fn ok(mut value: Value) -> Value {
    value["result"] = json!(0);
    value
}

fn param(request: &ApiRequest, key: &str) -> Option<u64> {
    request.query_value(key).and_then(|v| v.parse().ok())
}

/// Fake storage backend implementing [`Transport`]
pub struct FakeCloud {
    store: Mutex<Store>,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    token: Mutex<Option<String>>,
    short_downloads: Mutex<bool>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(Store::new()),
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            token: Mutex::new(None),
            short_downloads: Mutex::new(false),
        })
    }

    /// Number of requests received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Endpoints requested, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Hold every answer back for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Only accept requests carrying this `access_token`.
    pub fn require_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    /// Announce full lengths for downloads but send only half the bytes.
    pub fn truncate_downloads(&self) {
        *self.short_downloads.lock() = true;
    }

    pub fn file_data(&self, id: u64) -> Option<Bytes> {
        self.store.lock().files.get(&id).map(|f| f.data.clone())
    }

    pub fn has_folder(&self, id: u64) -> bool {
        self.store.lock().folders.contains_key(&id)
    }

    fn download(&self, path: &str) -> ApiResponse {
        let id = path
            .strip_prefix("/dl/")
            .and_then(|id| id.parse::<u64>().ok());
        let data = match id.and_then(|id| self.file_data(id)) {
            Some(data) => data,
            None => return ApiResponse::from_bytes(404, "not found"),
        };
        let declared = data.len() as u64;
        let served = if *self.short_downloads.lock() {
            data.slice(..data.len() / 2)
        } else {
            data
        };
        let chunks: Vec<ApiResult<Bytes>> = served
            .chunks(4096)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        ApiResponse {
            status: 200,
            headers: vec![(
                "Content-Type".to_string(),
                "application/octet-stream".to_string(),
            )],
            content_length: Some(declared),
            body: Box::pin(futures::stream::iter(chunks)),
        }
    }

    async fn answer(&self, mut request: ApiRequest) -> ApiResult<Value> {
        if let Some(token) = self.token.lock().clone() {
            if request.query_value("access_token") != Some(token.as_str()) {
                return Ok(error(2094, "Invalid 'access_token' provided."));
            }
        }

        let method = request.endpoint().to_string();
        let upload = match request.body.take() {
            Some(mut body) => {
                let mut data = BytesMut::new();
                while let Some(chunk) = body.stream.next().await {
                    data.extend_from_slice(&chunk?);
                }
                Some(data.freeze())
            }
            None => None,
        };

        let mut store = self.store.lock();
        let answer = match method.as_str() {
            "userinfo" => ok(json!({
                "userid": 7,
                "email": "someone@example.com",
                "emailverified": true,
                "quota": 10_737_418_240u64,
                "usedquota": 1024,
                "premium": false,
            })),
            "listfolder" => {
                let id = param(&request, "folderid").unwrap_or(0);
                if !store.folders.contains_key(&id) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                let depth = if param(&request, "recursive") == Some(1) {
                    usize::MAX
                } else {
                    1
                };
                ok(json!({ "metadata": store.folder_json(id, depth) }))
            }
            "createfolder" => {
                let parent = param(&request, "folderid").unwrap_or(0);
                let name = request.query_value("name").unwrap_or_default().to_string();
                if !store.folders.contains_key(&parent) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                if store.name_taken(parent, &name) {
                    return Ok(error(2004, "File or folder alredy exists."));
                }
                let id = store.allocate();
                store.folders.insert(
                    id,
                    Folder {
                        name,
                        parent: Some(parent),
                    },
                );
                ok(json!({ "metadata": store.folder_json(id, 0) }))
            }
            "deletefolder" => {
                let id = param(&request, "folderid").unwrap_or(0);
                if !store.folders.contains_key(&id) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                if !store.child_folders(id).is_empty() || !store.child_files(id).is_empty() {
                    return Ok(error(2006, "Folder is not empty."));
                }
                let metadata = store.folder_json(id, 0);
                store.folders.remove(&id);
                ok(json!({ "metadata": metadata }))
            }
            "deletefolderrecursive" => {
                let id = param(&request, "folderid").unwrap_or(0);
                if !store.folders.contains_key(&id) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                let (files, folders) = store.remove_tree(id);
                ok(json!({ "deletedfiles": files, "deletedfolders": folders }))
            }
            "renamefolder" => {
                let id = param(&request, "folderid").unwrap_or(0);
                if !store.folders.contains_key(&id) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                if let Some(to) = param(&request, "tofolderid") {
                    if !store.folders.contains_key(&to) {
                        return Ok(error(2005, "Directory does not exist."));
                    }
                    if let Some(folder) = store.folders.get_mut(&id) {
                        folder.parent = Some(to);
                    }
                }
                if let Some(name) = request.query_value("toname") {
                    if let Some(folder) = store.folders.get_mut(&id) {
                        folder.name = name.to_string();
                    }
                }
                ok(json!({ "metadata": store.folder_json(id, 0) }))
            }
            "copyfolder" => {
                let id = param(&request, "folderid").unwrap_or(0);
                let to = param(&request, "tofolderid").unwrap_or(0);
                if !store.folders.contains_key(&id) || !store.folders.contains_key(&to) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                let name = store.folders[&id].name.clone();
                if param(&request, "noover") == Some(1) && store.name_taken(to, &name) {
                    return Ok(error(2004, "File or folder alredy exists."));
                }
                let copy = store.copy_tree(id, to);
                ok(json!({ "metadata": store.folder_json(copy, 0) }))
            }
            "uploadfile" => {
                let parent = param(&request, "folderid").unwrap_or(0);
                if !store.folders.contains_key(&parent) {
                    return Ok(error(2005, "Directory does not exist."));
                }
                let name = request
                    .query_value("filename")
                    .unwrap_or_default()
                    .to_string();
                let id = store.allocate();
                store.files.insert(
                    id,
                    File {
                        name,
                        parent,
                        data: upload.unwrap_or_default(),
                    },
                );
                ok(json!({ "metadata": [store.file_json(id)], "fileids": [id] }))
            }
            "deletefile" => {
                let id = param(&request, "fileid").unwrap_or(0);
                if !store.files.contains_key(&id) {
                    return Ok(error(2009, "File not found."));
                }
                let metadata = store.file_json(id);
                store.files.remove(&id);
                ok(json!({ "metadata": metadata }))
            }
            "getfilelink" => {
                let id = param(&request, "fileid").unwrap_or(0);
                if !store.files.contains_key(&id) {
                    return Ok(error(2009, "File not found."));
                }
                ok(json!({
                    "hosts": [CONTENT_HOST],
                    "path": format!("/dl/{id}"),
                    "expires": LINK_EXPIRES,
                }))
            }
            "copyfile" => {
                let id = param(&request, "fileid").unwrap_or(0);
                let to = param(&request, "tofolderid").unwrap_or(0);
                let Some(source) = store.files.get(&id) else {
                    return Ok(error(2009, "File not found."));
                };
                let (name, data) = (source.name.clone(), source.data.clone());
                if param(&request, "noover") == Some(1) && store.name_taken(to, &name) {
                    return Ok(error(2004, "File or folder alredy exists."));
                }
                let copy = store.allocate();
                store.files.insert(copy, File { name, parent: to, data });
                ok(json!({ "metadata": store.file_json(copy) }))
            }
            "renamefile" => {
                let id = param(&request, "fileid").unwrap_or(0);
                let to = param(&request, "tofolderid");
                let name = request.query_value("toname").map(str::to_string);
                let Some(file) = store.files.get_mut(&id) else {
                    return Ok(error(2009, "File not found."));
                };
                if let Some(to) = to {
                    file.parent = to;
                }
                if let Some(name) = name {
                    file.name = name;
                }
                ok(json!({ "metadata": store.file_json(id) }))
            }
            _ => error(1000, "Unknown method."),
        };
        Ok(answer)
    }
}

#[async_trait]
impl Transport for FakeCloud {
    async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(request.endpoint().to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let content_prefix = format!("https://{CONTENT_HOST}");
        if let Some(path) = request.url.strip_prefix(&content_prefix) {
            return Ok(self.download(path));
        }

        let answer = self.answer(request).await?;
        Ok(ApiResponse::from_bytes(200, serde_json::to_vec(&answer)?))
    }
}

/// Service backed by `cloud`, with its own dispatcher.
pub fn service(cloud: &Arc<FakeCloud>) -> ApiService {
    ApiService::builder()
        .transport(cloud.clone())
        .api_host(HOST)
        .create()
        .unwrap()
}
