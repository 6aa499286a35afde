//! Per-mask load modes and the file transforms behind them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base64::Engine;
use thiserror::Error;

use super::xlsx::{Workbook, XlsxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructuredFormat {
    Json,
    Xml,
}

/// How a file's content is turned into the `data` value bound for the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadMode {
    /// Bind only the path parts; the content is not read.
    FullFileName,
    Utf8Text,
    Base64,
    HexBinary,
    /// Spreadsheet rows rendered as a structured document.
    TabularToStructured(StructuredFormat),
}

impl LoadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadMode::FullFileName => "full_file_name",
            LoadMode::Utf8Text => "utf8_text",
            LoadMode::Base64 => "base64",
            LoadMode::HexBinary => "hex_binary",
            LoadMode::TabularToStructured(StructuredFormat::Json) => "xlsx_json",
            LoadMode::TabularToStructured(StructuredFormat::Xml) => "xlsx_xml",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "full_file_name" | "fullFileName" => Ok(LoadMode::FullFileName),
            "utf8_text" | "bodyAsUtf8" => Ok(LoadMode::Utf8Text),
            "base64" | "bodyAsBase64" => Ok(LoadMode::Base64),
            "hex_binary" | "bodyAsBinary" => Ok(LoadMode::HexBinary),
            "xlsx_json" | "xlsx2json" => Ok(LoadMode::TabularToStructured(StructuredFormat::Json)),
            "xlsx_xml" | "xlsx2xml" => Ok(LoadMode::TabularToStructured(StructuredFormat::Xml)),
            other => Err(format!("unknown load mode \"{}\"", other)),
        }
    }
}

/// Transformed file content, before dialect-specific literal rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Mode that carries no content.
    Marker,
    Text(String),
    /// Raw bytes as lower-case hex digits.
    Hex(String),
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to read \"{path}\": {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to convert workbook \"{path}\": {source}")]
    Workbook { path: PathBuf, source: XlsxError },

    #[error("transform task failed: {0}")]
    Join(String),
}

pub async fn transform(mode: LoadMode, path: &Path) -> Result<Payload, TransformError> {
    let read = || async move {
        tokio::fs::read(path).await.map_err(|source| TransformError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    match mode {
        LoadMode::FullFileName => Ok(Payload::Marker),
        LoadMode::Utf8Text => {
            let bytes = read().await?;
            Ok(Payload::Text(String::from_utf8_lossy(&bytes).into_owned()))
        }
        LoadMode::Base64 => {
            let bytes = read().await?;
            Ok(Payload::Text(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ))
        }
        LoadMode::HexBinary => {
            let bytes = read().await?;
            Ok(Payload::Hex(hex::encode(bytes)))
        }
        LoadMode::TabularToStructured(format) => {
            let owned = path.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let rendered = Workbook::open(&owned).and_then(|book| match format {
                    StructuredFormat::Json => book.to_json(),
                    StructuredFormat::Xml => Ok(book.to_xml()),
                });
                rendered.map_err(|source| TransformError::Workbook {
                    path: owned,
                    source,
                })
            })
            .await
            .map_err(|e| TransformError::Join(e.to_string()))?
            .map(Payload::Text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::xlsx::tests::write_workbook;
    use tempfile::TempDir;

    #[test]
    fn test_mode_names_and_aliases() {
        for mode in [
            LoadMode::FullFileName,
            LoadMode::Utf8Text,
            LoadMode::Base64,
            LoadMode::HexBinary,
            LoadMode::TabularToStructured(StructuredFormat::Json),
            LoadMode::TabularToStructured(StructuredFormat::Xml),
        ] {
            assert_eq!(mode.to_string().parse::<LoadMode>(), Ok(mode));
        }
        assert_eq!("bodyAsBinary".parse::<LoadMode>(), Ok(LoadMode::HexBinary));
        assert_eq!(
            "xlsx2json".parse::<LoadMode>(),
            Ok(LoadMode::TabularToStructured(StructuredFormat::Json))
        );
        assert!("csv".parse::<LoadMode>().is_err());
    }

    #[tokio::test]
    async fn test_content_modes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.bin");
        std::fs::write(&path, [b'h', b'i', 0xff]).unwrap();

        assert_eq!(transform(LoadMode::FullFileName, &path).await.unwrap(), Payload::Marker);
        assert_eq!(
            transform(LoadMode::Utf8Text, &path).await.unwrap(),
            Payload::Text("hi\u{fffd}".into())
        );
        assert_eq!(
            transform(LoadMode::Base64, &path).await.unwrap(),
            Payload::Text("aGn/".into())
        );
        assert_eq!(
            transform(LoadMode::HexBinary, &path).await.unwrap(),
            Payload::Hex("6869ff".into())
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = transform(LoadMode::Utf8Text, &temp.path().join("gone.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Io { .. }));
        // Name-only mode never touches the file.
        assert!(transform(LoadMode::FullFileName, &temp.path().join("gone.txt"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_workbook_modes() {
        let temp = TempDir::new().unwrap();
        let path = write_workbook(temp.path(), "aa.xlsx");

        let Payload::Text(json) =
            transform(LoadMode::TabularToStructured(StructuredFormat::Json), &path)
                .await
                .unwrap()
        else {
            panic!("expected text payload");
        };
        assert!(json.contains("\"sheet0\""));

        let Payload::Text(xml) = transform(LoadMode::TabularToStructured(StructuredFormat::Xml), &path)
            .await
            .unwrap()
        else {
            panic!("expected text payload");
        };
        assert!(xml.starts_with("<sheets>"));

        let broken = temp.path().join("broken.xlsx");
        std::fs::write(&broken, "nope").unwrap();
        let err = transform(LoadMode::TabularToStructured(StructuredFormat::Xml), &broken)
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Workbook { .. }));
    }
}
