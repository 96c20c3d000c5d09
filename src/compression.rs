//! Byte-oriented compressor interface.
//!
//! The builder itself never compresses payload (a fresh volume carries none),
//! but the selected codec is recorded in the feature flags and per-subsystem
//! options, and the interface is exercised by the tools sharing this library.

use crate::error::{Error, Result};
use flate2::write::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// Compression types selectable on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionType {
    None,
    Zlib,
    Lzo,
    Unknown,
}

impl CompressionType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(CompressionType::None),
            "zlib" => Ok(CompressionType::Zlib),
            "lzo" => Ok(CompressionType::Lzo),
            _ => Err(Error::invalid(format!("unknown compression type '{value}'"))),
        }
    }

    /// Returns the codec backing this type.
    pub fn codec(self) -> Result<Box<dyn Compressor>> {
        match self {
            CompressionType::None => Ok(Box::new(NoneCodec)),
            CompressionType::Zlib => Ok(Box::new(ZlibCodec)),
            CompressionType::Lzo => Err(Error::invalid("lzo compression is not supported")),
            CompressionType::Unknown => Err(Error::invalid("compression type is not selected")),
        }
    }
}

/// A byte-oriented codec.
pub trait Compressor {
    /// Compresses `data`; returns `None` when the result would not be any
    /// smaller than the input.
    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Decompresses `data` into exactly `uncompr_size` bytes.
    fn decompress(&self, data: &[u8], uncompr_size: usize) -> Result<Vec<u8>>;
}

struct NoneCodec;

impl Compressor for NoneCodec {
    fn compress(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn decompress(&self, data: &[u8], uncompr_size: usize) -> Result<Vec<u8>> {
        if data.len() != uncompr_size {
            return Err(Error::invalid(format!(
                "stored size {} != expected size {uncompr_size}",
                data.len()
            )));
        }
        Ok(data.to_vec())
    }
}

struct ZlibCodec;

impl Compressor for ZlibCodec {
    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        if compressed.len() >= data.len() {
            return Ok(None);
        }
        Ok(Some(compressed))
    }

    fn decompress(&self, data: &[u8], uncompr_size: usize) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(Vec::with_capacity(uncompr_size));
        decoder.write_all(data)?;
        let out = decoder.finish()?;

        if out.len() != uncompr_size {
            return Err(Error::invalid(format!(
                "decompressed {} bytes, expected {uncompr_size}",
                out.len()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zlib_round_trip() {
        let codec = CompressionType::Zlib.codec().unwrap();
        let data = vec![0x5Au8; 4096];

        let compressed = codec.compress(&data).unwrap().unwrap();
        assert!(compressed.len() < data.len());

        let back = codec.decompress(&compressed, data.len()).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn incompressible_data_stays_raw() {
        let codec = CompressionType::Zlib.codec().unwrap();
        // High-entropy bytes, shorter than any zlib framing can win back.
        let data: Vec<u8> = (0..13u8).map(|b| b.wrapping_mul(167).wrapping_add(43)).collect();

        assert!(codec.compress(&data).unwrap().is_none());
    }

    #[test]
    fn lzo_is_rejected() {
        assert!(CompressionType::Lzo.codec().is_err());
    }

    #[test]
    fn parse_known_names() {
        assert_eq!(CompressionType::parse("none").unwrap(), CompressionType::None);
        assert_eq!(CompressionType::parse("zlib").unwrap(), CompressionType::Zlib);
        assert_eq!(CompressionType::parse("lzo").unwrap(), CompressionType::Lzo);
        assert!(CompressionType::parse("gzip").is_err());
    }
}
