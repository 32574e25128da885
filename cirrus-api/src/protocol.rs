//! JSON method protocol
//!
//! Every API method is an HTTP request to `{host}/{method}` answered with a
//! JSON object. `result` is zero on success; anything else comes with an
//! `error` message and is surfaced as [`ApiError::Api`].

use cirrus_core::{ApiError, ApiResult, DownloadOptions, RemoteEntry};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Default API endpoint
pub const DEFAULT_API_HOST: &str = "https://api.pcloud.com";

pub const LIST_FOLDER: &str = "listfolder";
pub const CREATE_FOLDER: &str = "createfolder";
pub const DELETE_FOLDER: &str = "deletefolder";
pub const DELETE_FOLDER_RECURSIVE: &str = "deletefolderrecursive";
pub const RENAME_FOLDER: &str = "renamefolder";
pub const COPY_FOLDER: &str = "copyfolder";
pub const UPLOAD_FILE: &str = "uploadfile";
pub const DELETE_FILE: &str = "deletefile";
pub const GET_FILE_LINK: &str = "getfilelink";
pub const COPY_FILE: &str = "copyfile";
pub const RENAME_FILE: &str = "renamefile";
pub const USER_INFO: &str = "userinfo";

/// Folder is not empty
pub const CODE_FOLDER_NOT_EMPTY: u32 = 2006;

/// Methods whose successful answers may be served from the response cache.
pub fn is_cacheable(method: &str) -> bool {
    matches!(method, LIST_FOLDER | USER_INFO)
}

/// Methods that change remote state.
pub fn is_mutating(method: &str) -> bool {
    matches!(
        method,
        CREATE_FOLDER
            | DELETE_FOLDER
            | DELETE_FOLDER_RECURSIVE
            | RENAME_FOLDER
            | COPY_FOLDER
            | UPLOAD_FILE
            | DELETE_FILE
            | COPY_FILE
            | RENAME_FILE
    )
}

#[derive(Deserialize)]
struct Status {
    result: u32,
    #[serde(default)]
    error: Option<String>,
}

/// Check the result code of a raw answer.
pub fn check(body: &[u8]) -> ApiResult<()> {
    let status: Status = serde_json::from_slice(body)?;
    if status.result == 0 {
        return Ok(());
    }
    let message = status
        .error
        .unwrap_or_else(|| format!("request failed with result {}", status.result));
    Err(ApiError::api(status.result, message))
}

/// Check the result code, then decode the payload.
pub fn parse<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    check(body)?;
    Ok(serde_json::from_slice(body)?)
}

/// `{ "metadata": {...} }`
#[derive(Debug, Deserialize)]
pub struct MetadataResponse {
    pub metadata: RemoteEntry,
}

/// `uploadfile` answer, one metadata object per uploaded file
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub metadata: Vec<RemoteEntry>,
}

/// `deletefolderrecursive` answer
#[derive(Debug, Deserialize)]
pub struct RecursiveDeleteResponse {
    #[serde(rename = "deletedfiles", default)]
    pub deleted_files: u64,
    #[serde(rename = "deletedfolders", default)]
    pub deleted_folders: u64,
}

/// Query parameters for `getfilelink`.
pub fn link_params(options: &DownloadOptions) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    if options.force_download {
        params.push(("forcedownload", "1".to_string()));
    }
    if options.skip_filename {
        params.push(("skipfilename", "1".to_string()));
    }
    if let Some(content_type) = &options.content_type {
        params.push(("contenttype", content_type.clone()));
    }
    params
}

/// Rejects names the API cannot store.
pub fn validate_name(name: &str) -> ApiResult<()> {
    if name.is_empty() {
        return Err(ApiError::invalid_argument("name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ApiError::invalid_argument(format!(
            "name must not contain path separators: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::TransportErrorKind;

    #[test]
    fn test_error_result() {
        let err = check(br#"{"result": 2006, "error": "Folder is not empty."}"#).unwrap_err();
        assert_eq!(err.api_code(), Some(CODE_FOLDER_NOT_EMPTY));
        assert_eq!(err.to_string(), "API error 2006: Folder is not empty.");
    }

    #[test]
    fn test_malformed_answer_is_protocol_error() {
        let err = check(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(
            err,
            ApiError::Transport {
                kind: TransportErrorKind::Protocol,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_metadata() {
        let body = br#"{
            "result": 0,
            "metadata": {"isfolder": true, "folderid": 5, "parentfolderid": 0, "name": "Docs"}
        }"#;
        let parsed: MetadataResponse = parse(body).unwrap();
        assert_eq!(parsed.metadata.name(), "Docs");
    }

    #[test]
    fn test_method_classes() {
        assert!(is_cacheable(LIST_FOLDER));
        assert!(!is_cacheable(UPLOAD_FILE));
        assert!(is_mutating(RENAME_FILE));
        assert!(!is_mutating(GET_FILE_LINK));
    }

    #[test]
    fn test_link_params() {
        let opts = DownloadOptions::new().skip_filename(true).content_type("text/plain");
        let params = link_params(&opts);
        assert_eq!(
            params,
            vec![
                ("skipfilename", "1".to_string()),
                ("contenttype", "text/plain".to_string())
            ]
        );
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Docs").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
    }
}
