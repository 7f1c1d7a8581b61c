//! Storage locations such as `gs://bucket/prefix/*.csv`, split into the store
//! they live in, an object prefix inside that store, and an optional
//! file-name pattern for the final segment.

use std::fmt;

use object_store::path::Path;

use crate::error::JobError;

const GLOB_META: &[char] = &['*', '?', '['];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Gcs,
    S3,
    Memory,
    Local,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "gs" => Some(Scheme::Gcs),
            "s3" | "s3a" => Some(Scheme::S3),
            "memory" => Some(Scheme::Memory),
            "file" => Some(Scheme::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Gcs => "gs",
            Scheme::S3 => "s3",
            Scheme::Memory => "memory",
            Scheme::Local => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    raw: String,
    scheme: Scheme,
    bucket: Option<String>,
    prefix: Path,
    pattern: Option<String>,
}

impl Location {
    /// Accepts `gs://`, `s3://`, `memory:///`, `file:///` URLs and bare
    /// filesystem paths. Relative paths are resolved against the current
    /// directory. Wildcards are only allowed in the last segment.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "location is empty"));
        }

        let (base, pattern) = split_pattern(trimmed);
        if base.contains(GLOB_META) {
            return Err(invalid(raw, "wildcards are only supported in the last path segment"));
        }

        let (scheme, bucket, path) = match base.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = Scheme::parse(&scheme.to_ascii_lowercase())
                    .ok_or_else(|| invalid(raw, &format!("unsupported scheme {scheme:?}")))?;
                match scheme {
                    Scheme::Gcs | Scheme::S3 => {
                        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
                        if bucket.is_empty() {
                            return Err(invalid(raw, "missing bucket name"));
                        }
                        (scheme, Some(bucket.to_string()), path.to_string())
                    }
                    Scheme::Memory => (scheme, None, rest.to_string()),
                    Scheme::Local => {
                        if !rest.starts_with('/') {
                            return Err(invalid(raw, "file:// locations must be absolute"));
                        }
                        (scheme, None, rest.to_string())
                    }
                }
            }
            None => {
                let mut path = std::path::PathBuf::from(base);
                if !path.is_absolute() {
                    let cwd = std::env::current_dir()
                        .map_err(|e| invalid(raw, &format!("cannot resolve relative path: {e}")))?;
                    path = cwd.join(path);
                }
                let path = path
                    .to_str()
                    .ok_or_else(|| invalid(raw, "path is not valid UTF-8"))?
                    .to_string();
                (Scheme::Local, None, path)
            }
        };

        Ok(Self {
            raw: trimmed.to_string(),
            scheme,
            bucket,
            prefix: Path::from(path.trim_matches('/')),
            pattern: pattern.map(str::to_string),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The prefix as a listing argument; `None` for the store root.
    pub fn list_prefix(&self) -> Option<&Path> {
        (!self.is_root()).then_some(&self.prefix)
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.prefix.as_ref().is_empty()
    }

    /// Key identifying the object store this location lives in.
    pub fn root(&self) -> String {
        match &self.bucket {
            Some(bucket) => format!("{}://{}", self.scheme.as_str(), bucket),
            None => format!("{}://", self.scheme.as_str()),
        }
    }

    /// Object path of `relative` underneath this location's prefix.
    pub fn join(&self, relative: &str) -> Path {
        let relative = relative.trim_matches('/');
        if self.is_root() {
            Path::from(relative)
        } else {
            Path::from(format!("{}/{}", self.prefix, relative))
        }
    }

    /// Full URI of an object in this location's store, for logs and errors.
    pub fn uri(&self, path: &Path) -> String {
        format!("{}/{}", self.root(), path)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_pattern(s: &str) -> (&str, Option<&str>) {
    match s.rsplit_once('/') {
        Some((head, tail)) if tail.contains(GLOB_META) => (head, Some(tail)),
        None if s.contains(GLOB_META) => ("", Some(s)),
        _ => (s, None),
    }
}

fn invalid(location: &str, reason: &str) -> JobError {
    JobError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}
