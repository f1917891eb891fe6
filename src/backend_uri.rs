//! Backend URI grammar for the repository façade (§4.5) and the
//! disaster-recovery bundler's reconnect-script generator, which both need
//! the same parse-then-render step; promoted to a standalone module rather
//! than a private helper on the façade (a supplemented structural choice —
//! see SPEC_FULL.md §4.5).

use crate::error::{RepositoryError, Result};

/// A parsed repository backend and its connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Filesystem { path: String },
    S3 { bucket: String, prefix: Option<String> },
    B2 { bucket: String, prefix: Option<String> },
    Azure { container: String, prefix: Option<String> },
    Gcs { bucket: String, prefix: Option<String> },
    Sftp { user: String, host: String, port: Option<u16>, path: String },
    /// Opaque pass-through for `rclone --remote-path=<remote>:<path>`.
    Rclone { remote_path: String },
}

impl Backend {
    /// Parse a repository URI per the grammar in §4.5. A bare path with no
    /// `://` is treated as `filesystem`, matching `_detect_backend`'s
    /// fallback in the original implementation.
    pub fn parse(uri: &str) -> Result<Backend> {
        if uri.starts_with("rclone --remote-path=") {
            return Ok(Backend::Rclone {
                remote_path: uri["rclone --remote-path=".len()..].to_string(),
            });
        }

        if !uri.contains("://") {
            return Ok(Backend::Filesystem { path: uri.to_string() });
        }

        let lower = uri.to_lowercase();
        if let Some(rest) = strip_scheme(uri, &lower, "s3://") {
            let (bucket, prefix) = split_bucket_prefix(rest);
            return Ok(Backend::S3 { bucket, prefix });
        }
        if let Some(rest) = strip_scheme(uri, &lower, "b2://") {
            let (bucket, prefix) = split_bucket_prefix(rest);
            return Ok(Backend::B2 { bucket, prefix });
        }
        if let Some(rest) = strip_scheme(uri, &lower, "azure://") {
            let (container, prefix) = split_bucket_prefix(rest);
            return Ok(Backend::Azure { container, prefix });
        }
        if let Some(rest) = strip_scheme(uri, &lower, "gs://") {
            let (bucket, prefix) = split_bucket_prefix(rest);
            return Ok(Backend::Gcs { bucket, prefix });
        }
        if let Some(rest) = strip_scheme(uri, &lower, "sftp://") {
            return parse_sftp(rest);
        }

        Err(RepositoryError::InvalidBackendUri(uri.to_string()).into())
    }

    /// The `kopia repository <create|connect> <backend> ...` argv tail for
    /// this backend, per §4.5's grammar table.
    pub fn engine_args(&self) -> Vec<String> {
        match self {
            Backend::Filesystem { path } => vec!["filesystem".into(), "--path".into(), path.clone()],
            Backend::S3 { bucket, prefix } => {
                let mut args = vec!["s3".into(), "--bucket".into(), bucket.clone()];
                if let Some(p) = prefix {
                    args.push("--prefix".into());
                    args.push(p.clone());
                }
                args
            }
            Backend::B2 { bucket, prefix } => {
                let mut args = vec!["b2".into(), "--bucket".into(), bucket.clone()];
                if let Some(p) = prefix {
                    args.push("--prefix".into());
                    args.push(p.clone());
                }
                args
            }
            Backend::Azure { container, prefix } => {
                let mut args = vec!["azure".into(), "--container".into(), container.clone()];
                if let Some(p) = prefix {
                    args.push("--prefix".into());
                    args.push(p.clone());
                }
                args
            }
            Backend::Gcs { bucket, prefix } => {
                let mut args = vec!["gcs".into(), "--bucket".into(), bucket.clone()];
                if let Some(p) = prefix {
                    args.push("--prefix".into());
                    args.push(p.clone());
                }
                args
            }
            Backend::Sftp { user, host, port, path } => {
                let mut args = vec![
                    "sftp".into(),
                    "--path".into(),
                    path.clone(),
                    "--host".into(),
                    host.clone(),
                    "--username".into(),
                    user.clone(),
                ];
                if let Some(p) = port {
                    args.push("--port".into());
                    args.push(p.to_string());
                }
                args
            }
            Backend::Rclone { remote_path } => {
                vec!["rclone".into(), "--remote-path".into(), remote_path.clone()]
            }
        }
    }

    /// Short discriminant used by the DR bundler's recovery info document
    /// (`repository.type`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Backend::Filesystem { .. } => "filesystem",
            Backend::S3 { .. } => "s3",
            Backend::B2 { .. } => "b2",
            Backend::Azure { .. } => "azure",
            Backend::Gcs { .. } => "gcs",
            Backend::Sftp { .. } => "sftp",
            Backend::Rclone { .. } => "rclone",
        }
    }
}

fn strip_scheme<'a>(original: &'a str, lower: &str, scheme: &str) -> Option<&'a str> {
    if lower.starts_with(scheme) {
        Some(&original[scheme.len()..])
    } else {
        None
    }
}

fn split_bucket_prefix(rest: &str) -> (String, Option<String>) {
    match rest.split_once('/') {
        Some((bucket, prefix)) if !prefix.is_empty() => (bucket.to_string(), Some(prefix.to_string())),
        Some((bucket, _)) => (bucket.to_string(), None),
        None => (rest.to_string(), None),
    }
}

fn parse_sftp(rest: &str) -> Result<Backend> {
    // sftp://<user>@<host>[:port]<path>
    let (user, remainder) = rest
        .split_once('@')
        .ok_or_else(|| RepositoryError::InvalidBackendUri(format!("sftp://{rest}")))?;
    let path_start = remainder
        .find('/')
        .ok_or_else(|| RepositoryError::InvalidBackendUri(format!("sftp://{rest}")))?;
    let host_port = &remainder[..path_start];
    let path = remainder[path_start..].to_string();

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => (
            h.to_string(),
            Some(p.parse::<u16>().map_err(|_| {
                RepositoryError::InvalidBackendUri(format!("sftp://{rest}"))
            })?),
        ),
        None => (host_port.to_string(), None),
    };

    Ok(Backend::Sftp { user: user.to_string(), host, port, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_path_as_filesystem() {
        assert_eq!(
            Backend::parse("/backup/kopia").unwrap(),
            Backend::Filesystem { path: "/backup/kopia".to_string() }
        );
    }

    #[test]
    fn parses_s3_with_and_without_prefix() {
        assert_eq!(
            Backend::parse("s3://my-bucket").unwrap(),
            Backend::S3 { bucket: "my-bucket".to_string(), prefix: None }
        );
        assert_eq!(
            Backend::parse("s3://my-bucket/a/b").unwrap(),
            Backend::S3 { bucket: "my-bucket".to_string(), prefix: Some("a/b".to_string()) }
        );
    }

    #[test]
    fn parses_sftp_with_port() {
        let parsed = Backend::parse("sftp://alice@example.com:2222/srv/backup").unwrap();
        assert_eq!(
            parsed,
            Backend::Sftp {
                user: "alice".to_string(),
                host: "example.com".to_string(),
                port: Some(2222),
                path: "/srv/backup".to_string(),
            }
        );
    }

    #[test]
    fn renders_engine_args_for_azure() {
        let backend = Backend::Azure { container: "c1".to_string(), prefix: Some("p".to_string()) };
        assert_eq!(
            backend.engine_args(),
            vec!["azure", "--container", "c1", "--prefix", "p"]
        );
    }

    #[test]
    fn rejects_unrecognized_scheme() {
        assert!(Backend::parse("ftp://nope").is_err());
    }
}
