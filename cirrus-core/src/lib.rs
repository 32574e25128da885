//! Cirrus Core
//!
//! Call execution and data transfer framework for the Cirrus storage client:
//! single-shot cancellable calls, the dispatcher they run on, streaming
//! sources and sinks with throttled progress, and the contracts the API
//! layer plugs its transport and credentials into.

pub mod auth;
pub mod call;
pub mod callback;
pub mod data;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod metadata;
pub mod progress;
pub mod transport;

pub use auth::{Authenticator, NoAuthentication};
pub use call::{Call, CallContext, CallEnv, CallHandle, CallId, CallState};
pub use callback::{Callback, Executor, InlineExecutor, Task};
pub use data::{
    BytesSource, DataReader, DataSink, DataSource, FileSink, FileSource, MemorySink, ReaderSource,
    WriterSink,
};
pub use dispatcher::{Dispatcher, Lease, DEFAULT_MAX_REQUESTS};
pub use entry::{EntryId, RemoteEntry, RemoteFile, RemoteFolder, ROOT_FOLDER_ID};
pub use error::{ApiError, ApiResult, ErrorKind, StateError, TransportErrorKind};
pub use metadata::{format_timestamp, DownloadOptions, FileLink, UserInfo};
pub use progress::{ProgressListener, ProgressTracker, DEFAULT_PROGRESS_THRESHOLD};
pub use transport::{ApiRequest, ApiResponse, ByteStream, HttpMethod, RequestBody, Transport};
