use anyhow::{Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;
const DAY: u64 = 24 * 60 * 60;
/// Longest session lifetime accepted. Keeps `expires_at` inside the four-digit
/// years that RFC 3339 text comparisons in SQL rely on.
const MAX_SESSION_TTL: Duration = Duration::from_secs(365 * DAY);
/// SigV4 presigned URLs are capped at seven days.
const MAX_PART_URL_TTL: Duration = Duration::from_secs(7 * DAY);
const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(DAY);

/// Centralized application configuration.
/// Combines environment variables and CLI arguments, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageConfig,
    pub uploads: UploadPolicy,
    pub sweep_interval: Duration,
}

/// Which object store backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    /// Files on local disk, presigned URLs served by this process.
    Local,
    /// AWS S3 or an S3-compatible endpoint.
    S3,
}

impl FromStr for StorageProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(format!("unknown storage provider `{}`", other)),
        }
    }
}

/// Object store connection settings.
#[derive(Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, R2, ...).
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Root directory of the local provider.
    pub local_root: String,
    /// Externally reachable base URL used when building local presigned URLs.
    pub public_base_url: String,
    /// HMAC key for local presigned URLs.
    pub signing_secret: String,
}

// Credentials stay out of logs.
impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("provider", &self.provider)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("local_root", &self.local_root)
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

/// Limits and timings applied to every upload session.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Fixed chunk size; every part but the last has exactly this length.
    pub part_size: u64,
    pub max_file_size: u64,
    pub allowed_content_types: Vec<String>,
    pub allowed_extensions: Vec<String>,
    /// Lifetime of an unfinished session before the sweeper expires it.
    pub session_ttl: Duration,
    pub part_url_ttl: Duration,
    /// Upper bound on a single object store control call.
    pub storage_timeout: Duration,
    /// Upper bound on calls that move object bytes: multipart completion and
    /// the staging-to-library copy. Must be shorter than `completion_lease`.
    pub transfer_timeout: Duration,
    /// Attempts for idempotent store reads (part listing, head).
    pub read_attempts: u32,
    /// How long one request may hold the right to run completion steps.
    pub completion_lease: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            part_size: 8 * MIB,
            max_file_size: 5 * 1024 * MIB,
            allowed_content_types: [
                "video/mp4",
                "video/quicktime",
                "video/x-msvideo",
                "video/webm",
                "video/x-matroska",
                "video/mpeg",
                "video/x-m4v",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_extensions: ["mp4", "mov", "avi", "webm", "mkv", "mpeg", "m4v"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            part_url_ttl: Duration::from_secs(60 * 60),
            storage_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(10 * 60),
            read_attempts: 3,
            completion_lease: Duration::from_secs(15 * 60),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable multipart video upload sessions")]
pub struct Args {
    /// Host to bind to (overrides VIDEO_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VIDEO_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides VIDEO_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage provider: `local` or `s3` (overrides VIDEO_UPLOAD_STORAGE_PROVIDER)
    #[arg(long)]
    pub storage_provider: Option<StorageProvider>,

    /// Root directory of the local provider (overrides VIDEO_UPLOAD_LOCAL_ROOT)
    #[arg(long)]
    pub local_root: Option<String>,

    /// Bucket name for the S3 provider (overrides VIDEO_UPLOAD_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_env(args)?;
        Ok((cfg, migrate))
    }

    fn from_env(args: Args) -> Result<Self> {
        let host = args
            .host
            .unwrap_or_else(|| env_string("VIDEO_UPLOAD_HOST", "0.0.0.0"));
        let port = match args.port {
            Some(port) => port,
            None => env_parse("VIDEO_UPLOAD_PORT", 3000)?,
        };
        let database_url = args.database_url.unwrap_or_else(|| {
            env_string(
                "VIDEO_UPLOAD_DATABASE_URL",
                "sqlite://./data/meta/video_uploads.db",
            )
        });

        let provider = match args.storage_provider {
            Some(provider) => provider,
            None => env_parse("VIDEO_UPLOAD_STORAGE_PROVIDER", StorageProvider::Local)?,
        };
        let storage = StorageConfig {
            provider,
            bucket: args
                .bucket
                .unwrap_or_else(|| env_string("VIDEO_UPLOAD_BUCKET", "course-videos")),
            region: env_string("VIDEO_UPLOAD_REGION", "us-east-1"),
            endpoint_url: env::var("VIDEO_UPLOAD_ENDPOINT_URL").ok(),
            access_key_id: env::var("VIDEO_UPLOAD_ACCESS_KEY_ID").ok(),
            secret_access_key: env::var("VIDEO_UPLOAD_SECRET_ACCESS_KEY").ok(),
            local_root: args
                .local_root
                .unwrap_or_else(|| env_string("VIDEO_UPLOAD_LOCAL_ROOT", "./data/objects")),
            public_base_url: env_string(
                "VIDEO_UPLOAD_PUBLIC_BASE_URL",
                &format!("http://127.0.0.1:{}", port),
            ),
            signing_secret: env::var("VIDEO_UPLOAD_SIGNING_SECRET").unwrap_or_default(),
        };

        let defaults = UploadPolicy::default();
        let uploads = UploadPolicy {
            part_size: env_parse("VIDEO_UPLOAD_PART_SIZE_MB", defaults.part_size / MIB)? * MIB,
            max_file_size: env_parse("VIDEO_MAX_SIZE_MB", defaults.max_file_size / MIB)? * MIB,
            session_ttl: Duration::from_secs(env_parse(
                "VIDEO_UPLOAD_SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )?),
            part_url_ttl: Duration::from_secs(env_parse(
                "VIDEO_UPLOAD_PART_URL_TTL_SECS",
                defaults.part_url_ttl.as_secs(),
            )?),
            storage_timeout: Duration::from_secs(env_parse(
                "VIDEO_UPLOAD_STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout.as_secs(),
            )?),
            transfer_timeout: Duration::from_secs(env_parse(
                "VIDEO_UPLOAD_TRANSFER_TIMEOUT_SECS",
                defaults.transfer_timeout.as_secs(),
            )?),
            read_attempts: env_parse("VIDEO_UPLOAD_READ_ATTEMPTS", defaults.read_attempts)?,
            completion_lease: Duration::from_secs(env_parse(
                "VIDEO_UPLOAD_COMPLETION_LEASE_SECS",
                defaults.completion_lease.as_secs(),
            )?),
            ..defaults
        };

        let sweep_interval =
            Duration::from_secs(env_parse("VIDEO_UPLOAD_SWEEP_INTERVAL_SECS", 300)?);
        let cfg = Self {
            host,
            port,
            database_url,
            storage,
            uploads,
            sweep_interval,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.uploads.part_size == 0 {
            bail!("part size must be greater than zero");
        }
        if self.uploads.read_attempts == 0 {
            bail!("VIDEO_UPLOAD_READ_ATTEMPTS must be at least 1");
        }
        if self.storage.provider == StorageProvider::Local && self.storage.signing_secret.is_empty()
        {
            bail!("VIDEO_UPLOAD_SIGNING_SECRET is required for the local storage provider");
        }
        if self.storage.provider == StorageProvider::S3 && self.uploads.part_size < 5 * MIB {
            bail!("S3 requires parts of at least 5 MiB");
        }

        let uploads = &self.uploads;
        check_duration(
            "VIDEO_UPLOAD_SESSION_TTL_SECS",
            uploads.session_ttl,
            MAX_SESSION_TTL,
        )?;
        check_duration(
            "VIDEO_UPLOAD_PART_URL_TTL_SECS",
            uploads.part_url_ttl,
            MAX_PART_URL_TTL,
        )?;
        check_duration(
            "VIDEO_UPLOAD_STORAGE_TIMEOUT_SECS",
            uploads.storage_timeout,
            MAX_CALL_TIMEOUT,
        )?;
        check_duration(
            "VIDEO_UPLOAD_TRANSFER_TIMEOUT_SECS",
            uploads.transfer_timeout,
            MAX_CALL_TIMEOUT,
        )?;
        check_duration(
            "VIDEO_UPLOAD_COMPLETION_LEASE_SECS",
            uploads.completion_lease,
            MAX_CALL_TIMEOUT,
        )?;
        check_duration(
            "VIDEO_UPLOAD_SWEEP_INTERVAL_SECS",
            self.sweep_interval,
            MAX_CALL_TIMEOUT,
        )?;
        if uploads.transfer_timeout >= uploads.completion_lease {
            bail!(
                "VIDEO_UPLOAD_TRANSFER_TIMEOUT_SECS ({}s) must be shorter than \
                 VIDEO_UPLOAD_COMPLETION_LEASE_SECS ({}s)",
                uploads.transfer_timeout.as_secs(),
                uploads.completion_lease.as_secs()
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn check_duration(name: &str, value: Duration, max: Duration) -> Result<()> {
    if value.is_zero() {
        bail!("{} must be greater than zero", name);
    }
    if value > max {
        bail!(
            "{} must be at most {}s, got {}s",
            name,
            max.as_secs(),
            value.as_secs()
        );
    }
    Ok(())
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("reading {}: {}", name, err)),
    }
}
