//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FRAMELOG_CONFIG or --config)
//! 3. Environment variables
//!
//! [`Config`] is the file form. [`EngineConfig`] is what the engine runs with;
//! it is built from a [`Config`] or directly with the `with_*` builders.

use framelog_codec::{DigestAdapter, DigestAlgorithm, TextCodec, Utf8Codec};
use framelog_store::{FileNaming, RotationPolicy, DEFAULT_MAX_FILE_BYTES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Wait for capacity.
    #[default]
    Suspend,
    /// Return `QueueFull` immediately.
    FailFast,
}

/// Fsync policy for appended frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every record (safest, slowest).
    EveryWrite,
    /// One fsync per writer batch.
    #[default]
    EveryBatch,
    /// Never fsync, rely on OS (fastest, least safe). `flush` still syncs.
    Never,
}

/// Engine configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where and how files are named.
    pub stream: StreamConfig,
    /// When files rotate and how many are kept.
    pub rotation: RotationConfig,
    /// Queue and durability settings.
    pub writer: WriterConfig,
}

impl Config {
    /// Loads configuration from `path` (or `FRAMELOG_CONFIG` when `None`),
    /// then applies environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FRAMELOG_CONFIG").map(PathBuf::from));
        if let Some(path) = path {
            config = Self::from_file(&path)?;
            tracing::debug!("Loaded config from {}", path.display());
        }

        // Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.stream.apply_env_overrides();
        self.rotation.apply_env_overrides();
        self.writer.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stream.naming()?;
        self.rotation.validate()?;
        self.writer.validate()
    }

    /// Builds the runtime configuration.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        self.validate()?;
        let mut engine = EngineConfig::new(&self.stream.dir)
            .with_naming(self.stream.naming()?)
            .with_digest(self.stream.digest.adapter())
            .with_rotation(self.rotation.policy())
            .with_max_files(self.rotation.max_files)
            .with_queue_capacity(self.writer.queue_capacity)
            .with_backpressure(self.writer.backpressure)
            .with_fsync_policy(self.writer.fsync_policy)
            .with_max_batch(self.writer.max_batch);
        engine.file_mode = self.stream.file_mode;
        engine.dir_mode = self.stream.dir_mode;
        Ok(engine)
    }
}

/// Stream location and file naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Directory holding the stream's files.
    pub dir: PathBuf,
    /// File name prefix.
    pub name: String,
    /// File extension (may be empty).
    pub extension: String,
    /// Digest used to chain frames.
    pub digest: DigestAlgorithm,
    /// Permission bits for new log files, in octal (e.g. "640"). Unix only.
    #[serde(with = "octal_mode", skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    /// Permission bits for a newly created stream directory, in octal. Unix only.
    #[serde(with = "octal_mode", skip_serializing_if = "Option::is_none")]
    pub dir_mode: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let naming = FileNaming::default();
        Self {
            dir: PathBuf::from("./logs"),
            name: naming.name().to_string(),
            extension: naming.extension().to_string(),
            digest: DigestAlgorithm::default(),
            file_mode: None,
            dir_mode: None,
        }
    }
}

impl StreamConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("FRAMELOG_DIR") {
            self.dir = PathBuf::from(dir);
        }

        if let Ok(name) = std::env::var("FRAMELOG_NAME") {
            self.name = name;
        }

        if let Ok(extension) = std::env::var("FRAMELOG_EXTENSION") {
            self.extension = extension;
        }

        if let Ok(digest) = std::env::var("FRAMELOG_DIGEST") {
            if let Ok(parsed) = digest.parse() {
                self.digest = parsed;
            }
        }

        if let Ok(mode) = std::env::var("FRAMELOG_FILE_MODE") {
            if let Ok(parsed) = octal_mode::parse(&mode) {
                self.file_mode = Some(parsed);
            }
        }

        if let Ok(mode) = std::env::var("FRAMELOG_DIR_MODE") {
            if let Ok(parsed) = octal_mode::parse(&mode) {
                self.dir_mode = Some(parsed);
            }
        }
    }

    /// Returns the validated naming scheme.
    pub fn naming(&self) -> Result<FileNaming, ConfigError> {
        FileNaming::new(&self.name, &self.extension)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Rotation thresholds and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotate once a file reaches this many bytes (0 = disabled).
    pub max_bytes: u64,
    /// Rotate once a file holds this many records (0 = disabled).
    pub max_records: u64,
    /// Rotate once a file is this many seconds old (0 = disabled).
    pub max_age_secs: u64,
    /// Number of files to keep (0 = unlimited).
    pub max_files: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_FILE_BYTES,
            max_records: 0,
            max_age_secs: 0,
            max_files: 5,
        }
    }
}

impl RotationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(bytes) = std::env::var("FRAMELOG_MAX_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.max_bytes = n;
            }
        }

        if let Ok(records) = std::env::var("FRAMELOG_MAX_RECORDS") {
            if let Ok(n) = records.parse() {
                self.max_records = n;
            }
        }

        if let Ok(age) = std::env::var("FRAMELOG_MAX_AGE_SECS") {
            if let Ok(secs) = age.parse() {
                self.max_age_secs = secs;
            }
        }

        if let Ok(files) = std::env::var("FRAMELOG_MAX_FILES") {
            if let Ok(n) = files.parse() {
                self.max_files = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_files(self.max_files)
    }

    /// Returns the max age as Duration, if enabled.
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy::new(self.max_bytes, self.max_records, self.max_age())
    }
}

/// Queue and durability settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    pub fsync_policy: FsyncPolicy,
    /// Maximum commands handled per writer wakeup.
    pub max_batch: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backpressure: Backpressure::default(),
            fsync_policy: FsyncPolicy::default(),
            max_batch: 64,
        }
    }
}

impl WriterConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("FRAMELOG_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(mode) = std::env::var("FRAMELOG_BACKPRESSURE") {
            match mode.to_lowercase().as_str() {
                "suspend" => self.backpressure = Backpressure::Suspend,
                "fail_fast" | "failfast" => self.backpressure = Backpressure::FailFast,
                _ => {}
            }
        }

        if let Ok(policy) = std::env::var("FRAMELOG_FSYNC") {
            match policy.to_lowercase().as_str() {
                "every_write" | "everywrite" => self.fsync_policy = FsyncPolicy::EveryWrite,
                "every_batch" | "everybatch" => self.fsync_policy = FsyncPolicy::EveryBatch,
                "never" => self.fsync_policy = FsyncPolicy::Never,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_queue(self.queue_capacity, self.max_batch)
    }
}

fn validate_max_files(max_files: usize) -> Result<(), ConfigError> {
    if max_files == 1 {
        return Err(ConfigError::ValidationError(
            "max_files must be 0 (unlimited) or at least 2".to_string(),
        ));
    }
    Ok(())
}

fn validate_queue(queue_capacity: usize, max_batch: usize) -> Result<(), ConfigError> {
    if queue_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "queue_capacity must be at least 1".to_string(),
        ));
    }
    if max_batch == 0 {
        return Err(ConfigError::ValidationError(
            "max_batch must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Unix permission bits as octal strings.
mod octal_mode {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        // An unquoted `640` in YAML arrives as a number; its digits are octal.
        Number(u64),
    }

    pub fn parse(s: &str) -> Result<u32, String> {
        let digits = s.trim().trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| format!("invalid permission mode '{}'", s))
    }

    pub fn serialize<S: Serializer>(mode: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match mode {
            Some(mode) => serializer.serialize_str(&format!("{:o}", mode)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u32>, D::Error> {
        let raw = Option::<Raw>::deserialize(deserializer)?;
        raw.map(|raw| match raw {
            Raw::Text(text) => parse(&text),
            Raw::Number(n) => parse(&n.to_string()),
        })
        .transpose()
        .map_err(serde::de::Error::custom)
    }
}

/// Runtime engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// Directory holding the stream's files.
    pub dir: PathBuf,
    pub naming: FileNaming,
    pub rotation: RotationPolicy,
    /// Number of files to keep (0 = unlimited).
    pub max_files: usize,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    pub fsync_policy: FsyncPolicy,
    pub max_batch: usize,
    pub digest: Arc<dyn DigestAdapter>,
    pub text: Arc<dyn TextCodec>,
    /// Permission bits for new log files (Unix only; umask still applies).
    pub file_mode: Option<u32>,
    /// Permission bits for the stream directory if it has to be created.
    pub dir_mode: Option<u32>,
}

impl EngineConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let rotation = RotationConfig::default();
        let writer = WriterConfig::default();
        Self {
            dir: dir.into(),
            naming: FileNaming::default(),
            rotation: rotation.policy(),
            max_files: rotation.max_files,
            queue_capacity: writer.queue_capacity,
            backpressure: writer.backpressure,
            fsync_policy: writer.fsync_policy,
            max_batch: writer.max_batch,
            digest: DigestAlgorithm::default().adapter(),
            text: Arc::new(Utf8Codec),
            file_mode: None,
            dir_mode: None,
        }
    }

    pub fn with_naming(mut self, naming: FileNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_digest(mut self, digest: Arc<dyn DigestAdapter>) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_text_codec(mut self, text: Arc<dyn TextCodec>) -> Self {
        self.text = text;
        self
    }

    pub fn with_file_mode(mut self, mode: u32) -> Self {
        self.file_mode = Some(mode);
        self
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = Some(mode);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_files(self.max_files)?;
        validate_queue(self.queue_capacity, self.max_batch)?;
        if self.digest.width() == 0 {
            return Err(ConfigError::ValidationError(
                "digest adapter produces empty digests".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("dir", &self.dir)
            .field("naming", &self.naming)
            .field("rotation", &self.rotation)
            .field("max_files", &self.max_files)
            .field("queue_capacity", &self.queue_capacity)
            .field("backpressure", &self.backpressure)
            .field("fsync_policy", &self.fsync_policy)
            .field("max_batch", &self.max_batch)
            .field("digest", &self.digest.name())
            .field("file_mode", &self.file_mode.map(|m| format!("{:o}", m)))
            .field("dir_mode", &self.dir_mode.map(|m| format!("{:o}", m)))
            .finish()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
