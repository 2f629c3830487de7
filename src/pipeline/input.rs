//! Source validation before a job starts.
//!
//! pdfium crashes or reports opaque errors on non-PDF input, so the file is
//! checked up front: it must exist, be readable, and start with the `%PDF`
//! magic bytes. Each failure maps to its own [`PipelineError`] variant so
//! the job's error log says exactly what was wrong.

use crate::error::PipelineError;
use std::io::{ErrorKind, Read};
use std::path::Path;
use tracing::debug;

/// Check that `path` names a readable PDF file.
pub fn validate_source(path: &Path) -> Result<(), PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    };

    let mut magic = [0u8; 4];
    let read = file.read(&mut magic).map_err(|e| PipelineError::CorruptPdf {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    if read < magic.len() || &magic != b"%PDF" {
        return Err(PipelineError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }

    debug!("validated source PDF: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file() {
        let err = validate_source(Path::new("/nonexistent/file.pdf")).unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[test]
    fn wrong_magic() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"PK\x03\x04 not a pdf").unwrap();
        let err = validate_source(f.path()).unwrap_err();
        match err {
            PipelineError::NotAPdf { magic, .. } => assert_eq!(&magic, b"PK\x03\x04"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_file_is_not_a_pdf() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"%P").unwrap();
        assert!(matches!(
            validate_source(f.path()),
            Err(PipelineError::NotAPdf { .. })
        ));
    }

    #[test]
    fn pdf_magic_accepted() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n").unwrap();
        assert!(validate_source(f.path()).is_ok());
    }
}
