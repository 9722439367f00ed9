use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Download,
    Extract,
    Date,
    Cache,
    Lock,
    Store,
    Job,
    Config,
    Api,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Download => write!(f, "download"),
            ErrorKind::Extract => write!(f, "extract"),
            ErrorKind::Date => write!(f, "date"),
            ErrorKind::Cache => write!(f, "cache"),
            ErrorKind::Lock => write!(f, "lock"),
            ErrorKind::Store => write!(f, "store"),
            ErrorKind::Job => write!(f, "job"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Api => write!(f, "api"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_download(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Download)
    }

    pub fn is_extract(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Extract)
    }

    pub fn is_date(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Date)
    }

    pub fn is_cache(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Cache)
    }

    pub fn is_store(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Store)
    }

    pub fn is_job(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Job)
    }

    pub fn is_timeout(&self) -> bool {
        if let Some(source) = &self.inner.source {
            source.to_string().to_lowercase().contains("timeout")
        } else {
            false
        }
    }

    pub fn is_connect(&self) -> bool {
        if let Some(source) = &self.inner.source {
            let msg = source.to_string().to_lowercase();
            msg.contains("connect") || msg.contains("connection")
        } else {
            false
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("bcv_rates::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<DownloadError> for Error {
    fn from(err: DownloadError) -> Self {
        Error::new(ErrorKind::Download, Some(err))
    }
}

impl From<ExtractError> for Error {
    fn from(err: ExtractError) -> Self {
        Error::new(ErrorKind::Extract, Some(err))
    }
}

impl From<DateError> for Error {
    fn from(err: DateError) -> Self {
        Error::new(ErrorKind::Date, Some(err))
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::new(ErrorKind::Cache, Some(err))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::new(ErrorKind::Store, Some(err))
    }
}

impl From<JobError> for Error {
    fn from(err: JobError) -> Self {
        Error::new(ErrorKind::Job, Some(err))
    }
}

impl From<crate::lock::LockError> for Error {
    fn from(err: crate::lock::LockError) -> Self {
        Error::new(ErrorKind::Lock, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Failed(#[source] BoxError),
    #[error("request timed out after {0}s")]
    Timeout(u64),
    #[error("connection failed: {0}")]
    Connect(#[source] BoxError),
    #[error("unexpected status: {0}")]
    Status(u16),
    #[error("client build failed: {0}")]
    ClientBuild(#[source] BoxError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("selector `{0}` matched nothing")]
    NotFound(&'static str),
    #[error("invalid rate value: {0}")]
    InvalidRate(String),
}

#[derive(Debug, Error)]
pub enum DateError {
    #[error("unknown month in `{0}`")]
    UnknownMonth(String),
    #[error("unrecognized date format: `{0}`")]
    UnrecognizedFormat(String),
    #[error("date out of range: `{0}`")]
    OutOfRange(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(#[source] BoxError),
    #[error("query execution error: {0}")]
    Query(#[source] BoxError),
    #[error("insert failed: {0}")]
    Insert(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a scraping job is already running")]
    Overlap,
    #[error("job timed out after {0}s")]
    Timeout(u64),
}

impl Error {
    pub fn selector_not_found(selector: &'static str) -> Self {
        Error::from(ExtractError::NotFound(selector))
    }

    pub fn invalid_rate(raw: impl Into<String>) -> Self {
        Error::from(ExtractError::InvalidRate(raw.into()))
    }

    pub fn download_failed<E: Into<BoxError>>(source: E) -> Self {
        Error::from(DownloadError::Failed(source.into()))
    }
}

impl From<sea_orm::DbErr> for Error {
    fn from(err: sea_orm::DbErr) -> Self {
        Error::from(StoreError::Query(err.to_string().into()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::from(CacheError::Serde(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::selector_not_found("#dolar");
        assert_eq!(err.to_string(), "extract error: selector `#dolar` matched nothing");
    }

    #[test]
    fn test_error_kinds() {
        let err = Error::invalid_rate("abc");
        assert!(err.is_extract());
        assert!(!err.is_download());

        let err = Error::from(JobError::Overlap);
        assert!(err.is_job());
    }

    #[test]
    fn test_error_source() {
        let err = Error::from(DownloadError::Timeout(30));
        assert!(err.source().is_some());
        assert!(err.is_timeout());
    }
}
