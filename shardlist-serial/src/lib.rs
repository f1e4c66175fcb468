//! Named storage formats for data-file payloads.
//!
//! A [`StorageFormat`] is a base encoding plus an optional compression
//! codec, referenced by name from a store manifest (`pickle-zstd`, `json`,
//! `newline-delimited-json`, ...). Names are normalized with `_` treated as
//! `-`, and each format owns a file extension so that data files are
//! self-describing on disk.
//!
//! Row-oriented formats encode a whole batch of serde rows into one
//! payload. The columnar `parquet` format routes rows through an inferred
//! Arrow schema; readers may instead open the resulting files with the
//! row-group-aware reader in the store crate.

mod avro;
pub mod error;

use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::sync::Arc;

use arrow::json::reader::infer_json_schema_from_iterator;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{de::DeserializeOwned, Serialize};

pub use error::{Result, SerialError};

const ZSTD_LEVEL: i32 = 3;
const ZLIB_LEVEL: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseFormat {
    /// Compact self-describing binary encoding of the whole batch.
    Pickle,
    /// The batch as one JSON array.
    Json,
    /// JSON via the fast-path writer; same bytes, kept as a distinct name
    /// so manifests written under either name stay readable.
    Orjson,
    /// One JSON document per line.
    NewlineDelimitedJson,
    Csv,
    Avro,
    /// Columnar; written with an inferred Arrow schema.
    Parquet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Zstd,
    Zlib,
}

/// A named (de)serializer for data-file payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageFormat {
    pub base: BaseFormat,
    pub codec: Codec,
}

impl Default for StorageFormat {
    fn default() -> Self {
        StorageFormat {
            base: BaseFormat::Pickle,
            codec: Codec::Zstd,
        }
    }
}

impl Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl std::str::FromStr for StorageFormat {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        StorageFormat::parse(s)
    }
}

impl StorageFormat {
    /// Look a format up by manifest name. `_` and `-` are interchangeable.
    pub fn parse(name: &str) -> Result<StorageFormat> {
        let normalized = name.replace('_', "-");
        let (stem, codec) = if let Some(stem) = normalized.strip_suffix("-zstd") {
            (stem, Codec::Zstd)
        } else if let Some(stem) = normalized.strip_suffix("-zlib") {
            (stem, Codec::Zlib)
        } else {
            (normalized.as_str(), Codec::Plain)
        };
        let base = match stem {
            "pickle" => BaseFormat::Pickle,
            "json" => BaseFormat::Json,
            "orjson" => BaseFormat::Orjson,
            "newline-delimited-json" => BaseFormat::NewlineDelimitedJson,
            "csv" => BaseFormat::Csv,
            "avro" => BaseFormat::Avro,
            "parquet" => BaseFormat::Parquet,
            _ => {
                return Err(SerialError::UnknownFormat {
                    name: name.to_string(),
                })
            }
        };
        if base == BaseFormat::Parquet && codec != Codec::Plain {
            // Parquet compresses internally per column chunk.
            return Err(SerialError::UnsupportedCodec {
                format: normalized.clone(),
            });
        }
        Ok(StorageFormat { base, codec })
    }

    pub fn name(&self) -> String {
        let stem = match self.base {
            BaseFormat::Pickle => "pickle",
            BaseFormat::Json => "json",
            BaseFormat::Orjson => "orjson",
            BaseFormat::NewlineDelimitedJson => "newline-delimited-json",
            BaseFormat::Csv => "csv",
            BaseFormat::Avro => "avro",
            BaseFormat::Parquet => "parquet",
        };
        match self.codec {
            Codec::Plain => stem.to_string(),
            Codec::Zstd => format!("{stem}-zstd"),
            Codec::Zlib => format!("{stem}-zlib"),
        }
    }

    /// File extension for data files in this format (no leading dot).
    pub fn extension(&self) -> String {
        let stem = match self.base {
            BaseFormat::Pickle => "pickle",
            BaseFormat::Json => "json",
            BaseFormat::Orjson => "orjson",
            BaseFormat::NewlineDelimitedJson => "ndjson",
            BaseFormat::Csv => "csv",
            BaseFormat::Avro => "avro",
            BaseFormat::Parquet => "parquet",
        };
        match self.codec {
            Codec::Plain => stem.to_string(),
            Codec::Zstd => format!("{stem}_zstd"),
            Codec::Zlib => format!("{stem}_zlib"),
        }
    }

    /// Columnar formats expose row-group substructure to readers; the store
    /// still writes them one batch per file.
    pub fn is_columnar(&self) -> bool {
        self.base == BaseFormat::Parquet
    }

    /// Serialize a batch of rows into one payload.
    pub fn encode_batch<T: Serialize>(&self, rows: &[T]) -> Result<Bytes> {
        let raw = match self.base {
            BaseFormat::Pickle => bincode::serialize(rows).map_err(|e| self.encode_err(e))?,
            BaseFormat::Json | BaseFormat::Orjson => {
                serde_json::to_vec(rows).map_err(|e| self.encode_err(e))?
            }
            BaseFormat::NewlineDelimitedJson => {
                let mut out = Vec::new();
                for row in rows {
                    serde_json::to_writer(&mut out, row).map_err(|e| self.encode_err(e))?;
                    out.push(b'\n');
                }
                out
            }
            BaseFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for row in rows {
                    writer.serialize(row).map_err(|e| self.encode_err(e))?;
                }
                writer
                    .into_inner()
                    .map_err(|e| self.encode_err(e.error()))?
            }
            BaseFormat::Avro => self.encode_avro(rows)?,
            BaseFormat::Parquet => self.encode_parquet(rows)?,
        };
        self.compress(raw)
    }

    /// Deserialize one payload back into its rows.
    pub fn decode_batch<T: DeserializeOwned>(&self, data: &[u8]) -> Result<Vec<T>> {
        let raw = self.decompress(data)?;
        match self.base {
            BaseFormat::Pickle => bincode::deserialize(&raw).map_err(|e| self.decode_err(e)),
            BaseFormat::Json | BaseFormat::Orjson => {
                serde_json::from_slice(&raw).map_err(|e| self.decode_err(e))
            }
            BaseFormat::NewlineDelimitedJson => raw
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .map(|line| serde_json::from_slice(line).map_err(|e| self.decode_err(e)))
                .collect(),
            BaseFormat::Csv => {
                let mut reader = csv::Reader::from_reader(raw.as_slice());
                reader
                    .deserialize()
                    .map(|row| row.map_err(|e| self.decode_err(e)))
                    .collect()
            }
            BaseFormat::Avro => self.decode_avro(&raw),
            BaseFormat::Parquet => self.decode_parquet(raw),
        }
    }

    fn encode_avro<T: Serialize>(&self, rows: &[T]) -> Result<Vec<u8>> {
        let first = rows.first().ok_or_else(|| SerialError::EmptyBatch {
            format: self.name(),
        })?;
        let sample = serde_json::to_value(first).map_err(|e| self.encode_err(e))?;
        let schema = avro::infer_schema(&sample)?;
        let mut writer = apache_avro::Writer::new(&schema, Vec::new());
        for row in rows {
            writer.append_ser(row).map_err(|e| self.encode_err(e))?;
        }
        writer.into_inner().map_err(|e| self.encode_err(e))
    }

    fn decode_avro<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<Vec<T>> {
        let reader = apache_avro::Reader::new(raw).map_err(|e| self.decode_err(e))?;
        reader
            .map(|value| {
                let value = value.map_err(|e| self.decode_err(e))?;
                apache_avro::from_value(&value).map_err(|e| self.decode_err(e))
            })
            .collect()
    }

    fn encode_parquet<T: Serialize>(&self, rows: &[T]) -> Result<Vec<u8>> {
        if rows.is_empty() {
            return Err(SerialError::EmptyBatch {
                format: self.name(),
            });
        }
        let values: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| serde_json::to_value(r).map_err(|e| self.encode_err(e)))
            .collect::<Result<_>>()?;
        let schema = infer_json_schema_from_iterator(
            values
                .iter()
                .map(|v| Ok::<_, arrow::error::ArrowError>(v.clone())),
        )
        .map_err(|e| self.encode_err(e))?;
        let mut decoder = arrow::json::ReaderBuilder::new(Arc::new(schema))
            .build_decoder()
            .map_err(|e| self.encode_err(e))?;
        decoder.serialize(&values).map_err(|e| self.encode_err(e))?;
        let batch = decoder
            .flush()
            .map_err(|e| self.encode_err(e))?
            .expect("decoder holds the rows just serialized");

        let mut out = Vec::new();
        let mut writer =
            ArrowWriter::try_new(&mut out, batch.schema(), None).map_err(|e| self.encode_err(e))?;
        writer.write(&batch).map_err(|e| self.encode_err(e))?;
        writer.close().map_err(|e| self.encode_err(e))?;
        Ok(out)
    }

    fn decode_parquet<T: DeserializeOwned>(&self, raw: Vec<u8>) -> Result<Vec<T>> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(raw))
            .map_err(|e| self.decode_err(e))?
            .build()
            .map_err(|e| self.decode_err(e))?;
        let mut writer = arrow::json::ArrayWriter::new(Vec::new());
        for batch in reader {
            let batch = batch.map_err(|e| self.decode_err(e))?;
            writer.write(&batch).map_err(|e| self.decode_err(e))?;
        }
        writer.finish().map_err(|e| self.decode_err(e))?;
        let json = writer.into_inner();
        if json.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&json).map_err(|e| self.decode_err(e))
    }

    fn compress(&self, raw: Vec<u8>) -> Result<Bytes> {
        match self.codec {
            Codec::Plain => Ok(Bytes::from(raw)),
            Codec::Zstd => zstd::bulk::compress(&raw, ZSTD_LEVEL)
                .map(Bytes::from)
                .map_err(|e| self.encode_err(e)),
            Codec::Zlib => {
                let mut enc = flate2::write::ZlibEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(ZLIB_LEVEL),
                );
                enc.write_all(&raw).map_err(|e| self.encode_err(e))?;
                enc.finish().map(Bytes::from).map_err(|e| self.encode_err(e))
            }
        }
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self.codec {
            Codec::Plain => Ok(data.to_vec()),
            Codec::Zstd => zstd::decode_all(data).map_err(|e| self.decode_err(e)),
            Codec::Zlib => {
                let mut out = Vec::new();
                flate2::read::ZlibDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| self.decode_err(e))?;
                Ok(out)
            }
        }
    }

    fn encode_err(&self, e: impl std::fmt::Display) -> SerialError {
        SerialError::Encode {
            format: self.name(),
            reason: e.to_string(),
        }
    }

    fn decode_err(&self, e: impl std::fmt::Display) -> SerialError {
        SerialError::Decode {
            format: self.name(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Car {
        make: String,
        year: i64,
        sales: i64,
    }

    fn cars() -> Vec<Car> {
        (0..5)
            .map(|i| Car {
                make: format!("make-{i}"),
                year: 2000 + i,
                sales: 100 * i,
            })
            .collect()
    }

    #[test]
    fn names_extensions_and_normalization() {
        let f = StorageFormat::parse("pickle_zstd").unwrap();
        assert_eq!(f.name(), "pickle-zstd");
        assert_eq!(f.extension(), "pickle_zstd");
        assert_eq!(f, StorageFormat::default());

        let f = StorageFormat::parse("newline-delimited-json-zstd").unwrap();
        assert_eq!(f.extension(), "ndjson_zstd");
        assert!(!f.is_columnar());

        assert!(StorageFormat::parse("parquet").unwrap().is_columnar());
        assert!(StorageFormat::parse("parquet-zstd").is_err());
        assert!(StorageFormat::parse("msgpack").is_err());
    }

    #[test]
    fn every_required_registry_name_parses() {
        for name in [
            "pickle-zstd",
            "json",
            "json-zstd",
            "orjson",
            "newline-delimited-json",
            "parquet",
            "avro",
            "csv",
        ] {
            StorageFormat::parse(name).unwrap();
        }
    }

    #[test]
    fn default_format_round_trips_rows() {
        let f = StorageFormat::default();
        let bytes = f.encode_batch(&cars()).unwrap();
        let back: Vec<Car> = f.decode_batch(&bytes).unwrap();
        assert_eq!(back, cars());
    }

    #[test]
    fn parquet_round_trips_via_inferred_schema() {
        let f = StorageFormat::parse("parquet").unwrap();
        let bytes = f.encode_batch(&cars()).unwrap();
        let back: Vec<Car> = f.decode_batch(&bytes).unwrap();
        assert_eq!(back, cars());
        assert!(f.encode_batch::<Car>(&[]).is_err());
    }

    #[test]
    fn csv_and_avro_handle_flat_rows() {
        for name in ["csv", "avro"] {
            let f = StorageFormat::parse(name).unwrap();
            let bytes = f.encode_batch(&cars()).unwrap();
            let back: Vec<Car> = f.decode_batch(&bytes).unwrap();
            assert_eq!(back, cars(), "format {name}");
        }
    }

    #[test]
    fn compressed_json_is_smaller_than_plain_on_repetitive_rows() {
        let rows: Vec<Car> = (0..500)
            .map(|_| Car {
                make: "the same make every time".to_string(),
                year: 2024,
                sales: 1,
            })
            .collect();
        let plain = StorageFormat::parse("json").unwrap();
        let zstd = StorageFormat::parse("json-zstd").unwrap();
        let a = plain.encode_batch(&rows).unwrap();
        let b = zstd.encode_batch(&rows).unwrap();
        assert!(b.len() < a.len());
        let back: Vec<Car> = zstd.decode_batch(&b).unwrap();
        assert_eq!(back.len(), 500);
    }
}
