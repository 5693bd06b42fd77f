use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::config::READ_BUFFER_SIZE;
use crate::error::{IngestError, Result};

/// Compression applied to the source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Pick from the file extension (`.gz` means gzip)
    #[default]
    Auto,
    Gzip,
    None,
}

impl Compression {
    /// Parse compression from string (case-insensitive)
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Compression::Auto),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "none" => Ok(Compression::None),
            _ => Err(anyhow::anyhow!(
                "Unsupported compression: {}. Supported: auto, gzip, none",
                s
            )),
        }
    }

    /// Resolve `Auto` against a concrete path
    pub fn resolve(self, path: &Path) -> Compression {
        match self {
            Compression::Auto => {
                let is_gz = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
                if is_gz {
                    Compression::Gzip
                } else {
                    Compression::None
                }
            }
            other => other,
        }
    }
}

/// Open a local file as a decompressed byte stream
///
/// Nothing is read beyond the first buffer fill; decompression happens as the
/// caller pulls bytes.
pub fn open_source(path: &Path, compression: Compression) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).map_err(|source| IngestError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;

    let metadata = file
        .metadata()
        .map_err(|source| IngestError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
    if metadata.is_dir() {
        return Err(IngestError::SourceUnavailable {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "is a directory"),
        });
    }

    let buffered = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    Ok(match compression.resolve(path) {
        // Multi-member gzip streams are common for concatenated exports
        Compression::Gzip => Box::new(MultiGzDecoder::new(buffered)),
        _ => Box::new(buffered),
    })
}
