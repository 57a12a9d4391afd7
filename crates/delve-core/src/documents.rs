//! Text extraction for uploaded documents.

use crate::error::DocumentError;
use crate::model::FileType;

/// Turns raw upload bytes into plain text.
///
/// Extraction is CPU-bound and synchronous; callers run it on a blocking
/// thread.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], file_type: FileType) -> Result<String, DocumentError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTextExtractor;

impl TextExtractor for DefaultTextExtractor {
    fn extract(&self, bytes: &[u8], file_type: FileType) -> Result<String, DocumentError> {
        let text = match file_type {
            FileType::Txt => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|err| DocumentError::Extraction(format!("text is not valid UTF-8: {err}")))?,
            FileType::Pdf => extract_pdf(bytes)?,
        };

        if text.trim().is_empty() {
            return Err(DocumentError::Extraction(
                "document contains no extractable text".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(feature = "pdf")]
fn extract_pdf(bytes: &[u8]) -> Result<String, DocumentError> {
    // pdf-extract panics on some malformed inputs.
    let outcome = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes));
    match outcome {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(DocumentError::Extraction(format!("{err:?}"))),
        Err(_) => Err(DocumentError::Extraction(
            "pdf parser aborted on malformed input".to_string(),
        )),
    }
}

#[cfg(not(feature = "pdf"))]
fn extract_pdf(_bytes: &[u8]) -> Result<String, DocumentError> {
    Err(DocumentError::UnsupportedFormat(
        "pdf support is not compiled in".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let text = DefaultTextExtractor
            .extract("Lithium supply notes".as_bytes(), FileType::Txt)
            .unwrap();
        assert_eq!(text, "Lithium supply notes");
    }

    #[test]
    fn invalid_utf8_is_extraction_error() {
        let err = DefaultTextExtractor
            .extract(&[0xff, 0xfe, 0x00], FileType::Txt)
            .unwrap_err();
        assert!(matches!(err, DocumentError::Extraction(_)));
    }

    #[test]
    fn blank_text_is_extraction_error() {
        let err = DefaultTextExtractor
            .extract(b"   \n\t", FileType::Txt)
            .unwrap_err();
        assert!(matches!(err, DocumentError::Extraction(_)));
    }

    #[test]
    fn garbage_pdf_fails_without_panicking() {
        let result = DefaultTextExtractor.extract(b"not a pdf at all", FileType::Pdf);
        assert!(result.is_err());
    }
}
