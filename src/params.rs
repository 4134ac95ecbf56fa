//! Immutable configuration consumed by [`crate::ThreadWriter`] and
//! [`crate::storage`]. A `Parameters` value is settled once (either built by
//! hand or via [`Parameters::from_env`]) and then shared by reference; there
//! is no process-global mutable config.

use std::env;

/// How `u64` arrays are compressed before hitting disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    /// No compression.
    #[default]
    None,
    /// ZSTD, level controlled by [`Parameters::zstd_compression_level`].
    Zstd,
    /// Lossy fixed-width bucket quantisation. Good for statistics, not
    /// timestamps.
    Histogram,
    /// Lossy numeric compression modeled after the ZFP codec.
    Zfp,
    /// Lossy numeric compression modeled after the SZ codec.
    Sz,
}

impl CompressionAlgorithm {
    /// Whether this algorithm loses information, and therefore forces
    /// [`EncodingAlgorithm::None`].
    pub fn is_lossy(self) -> bool {
        matches!(self, Self::Histogram | Self::Zfp | Self::Sz)
    }
}

/// How `u64` arrays are encoded prior to (optional) compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingAlgorithm {
    /// Values are written as raw little-endian `u64`s.
    #[default]
    None,
    /// Each value is truncated to the minimal byte width that covers the
    /// array's bitwise-OR of all elements.
    Masking,
}

/// Loop-detection strategy used by [`crate::thread_writer::ThreadWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFindingAlgorithm {
    /// Loop detection disabled; the grammar degenerates to a flat sequence.
    None,
    /// Check every candidate loop length on every append. O(n^2) worst case.
    Basic,
    /// Like `Basic`, but candidate lengths are capped at `max_loop_length`.
    BasicTruncated,
    /// Only check loop lengths ending at the last appended token. The
    /// intended production path: same semantics as `Basic`, cheaper on long
    /// sequences.
    Filter,
}

impl Default for LoopFindingAlgorithm {
    fn default() -> Self {
        Self::Filter
    }
}

/// What gets stored in the per-event/per-sequence duration side files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampStorage {
    /// Don't persist timestamps/durations at all.
    None,
    /// Store successive differences (durations). This is the format the
    /// writer produces natively.
    #[default]
    Delta,
    /// Store absolute timestamps.
    Timestamp,
}

/// Verbosity gate for [`log`] calls emitted by the core. Maps onto `log`'s
/// standard levels rather than a bespoke macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DebugLevel {
    /// Only fatal-bug assertions are ever reported (those panic regardless).
    Error,
    /// Recoverable errors are suppressed.
    Quiet,
    /// Default verbosity: warnings for recoverable errors.
    #[default]
    Normal,
    /// Warnings plus informational messages.
    Verbose,
    /// Debug-level tracing of grammar construction.
    Debug,
    /// Everything, including per-token tracing.
    Max,
}

impl DebugLevel {
    /// The [`log::LevelFilter`] this debug level maps onto.
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Quiet => log::LevelFilter::Error,
            Self::Normal => log::LevelFilter::Warn,
            Self::Verbose => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Max => log::LevelFilter::Trace,
        }
    }
}

/// Immutable set of writer/reader tuning knobs, persisted verbatim into the
/// global archive header (see storage layout).
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Compression stage of the codec pipeline.
    pub compression_algorithm: CompressionAlgorithm,
    /// Encoding stage of the codec pipeline. Forced to `None` whenever
    /// `compression_algorithm` is lossy.
    pub encoding_algorithm: EncodingAlgorithm,
    /// ZSTD compression level, used only when `compression_algorithm ==
    /// Zstd`.
    pub zstd_compression_level: u8,
    /// Loop-detector algorithm.
    pub loop_finding_algorithm: LoopFindingAlgorithm,
    /// Longest loop body considered, used only by `BasicTruncated`.
    pub max_loop_length: u64,
    /// Convention used when writing timestamp/duration side files.
    pub timestamp_storage: TimestampStorage,
    /// Verbosity gate for core logging.
    pub debug_level: DebugLevel,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            compression_algorithm: CompressionAlgorithm::default(),
            encoding_algorithm: EncodingAlgorithm::default(),
            zstd_compression_level: 3,
            loop_finding_algorithm: LoopFindingAlgorithm::default(),
            max_loop_length: 100,
            timestamp_storage: TimestampStorage::default(),
            debug_level: DebugLevel::default(),
        }
    }
}

impl Parameters {
    /// Normalises `encoding_algorithm` down to `None` when the compression
    /// stage is lossy, per spec: "Compression is lossy ⇔ encoding must be
    /// None."
    pub fn normalized(mut self) -> Self {
        if self.compression_algorithm.is_lossy() {
            self.encoding_algorithm = EncodingAlgorithm::None;
        }
        self
    }

    /// Builds a settled `Parameters` value from the `PALLAS_*` environment
    /// variables. Unset variables fall back to [`Parameters::default`].
    /// This is the one piece of the environment/JSON parameter loader that
    /// stays in-core: the *parsing* of a handful of env vars into a plain
    /// value, not the general config-file loader.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let compression_algorithm = match env::var("PALLAS_COMPRESSION").ok().as_deref() {
            Some("zstd") | Some("ZSTD") => CompressionAlgorithm::Zstd,
            Some("histogram") | Some("HISTOGRAM") => CompressionAlgorithm::Histogram,
            Some("zfp") | Some("ZFP") => CompressionAlgorithm::Zfp,
            Some("sz") | Some("SZ") => CompressionAlgorithm::Sz,
            Some("none") | Some("NONE") => CompressionAlgorithm::None,
            _ => defaults.compression_algorithm,
        };

        let encoding_algorithm = match env::var("PALLAS_ENCODING").ok().as_deref() {
            Some("masking") | Some("MASKING") => EncodingAlgorithm::Masking,
            Some("none") | Some("NONE") => EncodingAlgorithm::None,
            _ => defaults.encoding_algorithm,
        };

        let loop_finding_algorithm = match env::var("PALLAS_LOOP_FINDING").ok().as_deref() {
            Some("none") | Some("NONE") => LoopFindingAlgorithm::None,
            Some("basic") | Some("BASIC") => LoopFindingAlgorithm::Basic,
            Some("basictruncated") | Some("BASIC_TRUNCATED") => {
                LoopFindingAlgorithm::BasicTruncated
            }
            Some("filter") | Some("FILTER") => LoopFindingAlgorithm::Filter,
            _ => defaults.loop_finding_algorithm,
        };

        let max_loop_length = env::var("PALLAS_LOOP_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_loop_length);

        let zstd_compression_level = env::var("PALLAS_ZSTD_LVL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.zstd_compression_level);

        let timestamp_storage = match env::var("PALLAS_TIMESTAMP_STORAGE").ok().as_deref() {
            Some("none") | Some("NONE") => TimestampStorage::None,
            Some("delta") | Some("DELTA") => TimestampStorage::Delta,
            Some("timestamp") | Some("TIMESTAMP") => TimestampStorage::Timestamp,
            _ => defaults.timestamp_storage,
        };

        let debug_level = match env::var("PALLAS_DEBUG_LVL").ok().as_deref() {
            Some("error") | Some("ERROR") => DebugLevel::Error,
            Some("quiet") | Some("QUIET") => DebugLevel::Quiet,
            Some("normal") | Some("NORMAL") => DebugLevel::Normal,
            Some("verbose") | Some("VERBOSE") => DebugLevel::Verbose,
            Some("debug") | Some("DEBUG") => DebugLevel::Debug,
            Some("max") | Some("MAX") => DebugLevel::Max,
            _ => defaults.debug_level,
        };

        Self {
            compression_algorithm,
            encoding_algorithm,
            zstd_compression_level,
            loop_finding_algorithm,
            max_loop_length,
            timestamp_storage,
            debug_level,
        }
        .normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_lossless_and_filter() {
        let p = Parameters::default();
        assert_eq!(p.compression_algorithm, CompressionAlgorithm::None);
        assert_eq!(p.loop_finding_algorithm, LoopFindingAlgorithm::Filter);
    }

    #[test]
    fn lossy_compression_forces_no_encoding() {
        let p = Parameters {
            compression_algorithm: CompressionAlgorithm::Histogram,
            encoding_algorithm: EncodingAlgorithm::Masking,
            ..Parameters::default()
        }
        .normalized();
        assert_eq!(p.encoding_algorithm, EncodingAlgorithm::None);
    }
}
