use crate::backends::s3::S3Settings;
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr};

/// Which storage backend the gateway delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Local,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!(
                "unknown backend `{}` (expected s3, local or memory)",
                other
            )),
        }
    }
}

/// Request body encodings accepted by the upload endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEncoding {
    /// `multipart/form-data` with a `file` part.
    Multipart,
    /// JSON body carrying base64 file content.
    Base64Json,
}

impl UploadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multipart => "multipart",
            Self::Base64Json => "base64-json",
        }
    }
}

impl fmt::Display for UploadEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadEncoding {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "multipart" => Ok(Self::Multipart),
            "base64-json" | "json" => Ok(Self::Base64Json),
            other => Err(anyhow!(
                "unknown upload encoding `{}` (expected multipart or base64-json)",
                other
            )),
        }
    }
}

/// Parse a comma-separated encoding list, e.g. `multipart,base64-json`.
pub fn parse_encodings(value: &str) -> Result<Vec<UploadEncoding>> {
    let mut encodings = Vec::new();
    for part in value.split(',').filter(|p| !p.trim().is_empty()) {
        let encoding = part.parse::<UploadEncoding>()?;
        if !encodings.contains(&encoding) {
            encodings.push(encoding);
        }
    }
    if encodings.is_empty() {
        bail!("at least one upload encoding must be enabled");
    }
    Ok(encodings)
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: BackendKind,
    pub bucket: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub storage_dir: String,
    pub database_url: String,
    pub upload_encodings: Vec<UploadEncoding>,
    pub max_upload_bytes: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("static_credentials", &self.access_key.is_some())
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("upload_encodings", &self.upload_encodings)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "HTTP gateway in front of an object-storage bucket")]
pub struct Args {
    /// Host to bind to (overrides STORAGE_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORAGE_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Storage backend: s3, local or memory (overrides STORAGE_GATEWAY_BACKEND)
    #[arg(long)]
    pub backend: Option<String>,

    /// Bucket to proxy (overrides STORAGE_GATEWAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Bucket region (overrides STORAGE_GATEWAY_REGION)
    #[arg(long)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint URL (overrides STORAGE_GATEWAY_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Directory for object payloads of the local backend (overrides STORAGE_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL of the local backend (overrides STORAGE_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Accepted upload encodings, comma separated (overrides STORAGE_GATEWAY_UPLOAD_ENCODINGS)
    #[arg(long)]
    pub upload_encodings: Option<String>,

    /// Largest accepted upload body in bytes (overrides STORAGE_GATEWAY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,
}

/// Read an optional variable, treating empty values as unset.
fn env_opt(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_opt(name)?
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse())
    }

    /// Merge parsed CLI args over the environment and defaults.
    pub fn resolve(args: Args) -> Result<Self> {
        let backend = match args.backend.or(env_opt("STORAGE_GATEWAY_BACKEND")?) {
            Some(value) => value.parse()?,
            None => BackendKind::S3,
        };
        let upload_encodings = match args
            .upload_encodings
            .or(env_opt("STORAGE_GATEWAY_UPLOAD_ENCODINGS")?)
        {
            Some(value) => parse_encodings(&value).context("parsing upload encodings")?,
            None => vec![UploadEncoding::Multipart, UploadEncoding::Base64Json],
        };

        let cfg = Self {
            host: args
                .host
                .or(env_opt("STORAGE_GATEWAY_HOST")?)
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => env_parsed("STORAGE_GATEWAY_PORT")?.unwrap_or(3000),
            },
            backend,
            bucket: args.bucket.or(env_opt("STORAGE_GATEWAY_BUCKET")?),
            region: args
                .region
                .or(env_opt("STORAGE_GATEWAY_REGION")?)
                .unwrap_or_else(|| "us-east-1".into()),
            endpoint: args.endpoint.or(env_opt("STORAGE_GATEWAY_ENDPOINT")?),
            access_key: env_opt("STORAGE_GATEWAY_ACCESS_KEY")?,
            secret_key: env_opt("STORAGE_GATEWAY_SECRET_KEY")?,
            storage_dir: args
                .storage_dir
                .or(env_opt("STORAGE_GATEWAY_STORAGE_DIR")?)
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or(env_opt("STORAGE_GATEWAY_DATABASE_URL")?)
                .unwrap_or_else(|| "sqlite://./data/meta/gateway.db".into()),
            upload_encodings,
            max_upload_bytes: match args.max_upload_bytes {
                Some(limit) => limit,
                None => env_parsed("STORAGE_GATEWAY_MAX_UPLOAD_BYTES")?.unwrap_or(100 * 1024 * 1024),
            },
        };

        if cfg.backend == BackendKind::S3 && cfg.bucket.is_none() {
            bail!("STORAGE_GATEWAY_BUCKET (or --bucket) is required for the s3 backend");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn s3_settings(&self) -> Result<S3Settings> {
        let bucket = self
            .bucket
            .clone()
            .context("no bucket configured for the s3 backend")?;
        Ok(S3Settings {
            bucket,
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encoding_lists() {
        assert_eq!(
            parse_encodings("multipart, base64-json,multipart").unwrap(),
            vec![UploadEncoding::Multipart, UploadEncoding::Base64Json]
        );
        assert_eq!(
            parse_encodings("json").unwrap(),
            vec![UploadEncoding::Base64Json]
        );
        assert!(parse_encodings("").is_err());
        assert!(parse_encodings("xml").is_err());
    }

    #[test]
    fn parses_backend_kinds() {
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(" memory ".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("gcs".parse::<BackendKind>().is_err());
    }

    #[test]
    fn cli_args_take_precedence() {
        let cfg = AppConfig::resolve(Args {
            host: Some("127.0.0.1".into()),
            port: Some(8080),
            backend: Some("s3".into()),
            bucket: Some("reports".into()),
            region: Some("eu-west-1".into()),
            upload_encodings: Some("multipart".into()),
            max_upload_bytes: Some(1024),
            ..Args::default()
        })
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.backend, BackendKind::S3);
        assert_eq!(cfg.upload_encodings, vec![UploadEncoding::Multipart]);
        assert_eq!(cfg.max_upload_bytes, 1024);

        let s3 = cfg.s3_settings().unwrap();
        assert_eq!(s3.bucket, "reports");
        assert_eq!(s3.region, "eu-west-1");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let cfg = AppConfig::resolve(Args {
            backend: Some("memory".into()),
            ..Args::default()
        })
        .unwrap();
        let mut with_secret = cfg.clone();
        with_secret.secret_key = Some("super-secret".into());
        assert!(!format!("{:?}", with_secret).contains("super-secret"));
    }
}
