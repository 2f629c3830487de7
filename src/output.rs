//! On-disk output of a job.
//!
//! ```text
//! report_converted/
//! ├── index.md          ← batches appended in page order
//! └── images/
//!     ├── 3_fig1.png
//!     └── 3_fig2.png
//! ```
//!
//! Each committed batch is a single append to `index.md`, so a crash or a
//! cancellation never leaves half a batch behind. Figures are written to a
//! temp file in the same directory and renamed into place.

use crate::error::PipelineError;
use crate::pipeline::figures::ExtractedImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const MARKDOWN_FILE: &str = "index.md";
pub const IMAGES_DIR: &str = "images";

/// `{stem}_converted` next to the source, or under `parent` when given.
pub fn output_dir_for(source: &Path, parent: Option<&Path>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let dir = format!("{stem}_converted");
    match parent.or_else(|| source.parent()) {
        Some(p) => p.join(dir),
        None => PathBuf::from(dir),
    }
}

fn write_failed(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug)]
pub struct OutputWriter {
    root: PathBuf,
    markdown_path: PathBuf,
    images_dir: PathBuf,
    batches_written: usize,
}

impl OutputWriter {
    /// Create the directory layout and start an empty `index.md`, replacing
    /// any output of a previous run.
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        let images_dir = root.join(IMAGES_DIR);
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| write_failed(&images_dir, e))?;

        let markdown_path = root.join(MARKDOWN_FILE);
        tokio::fs::write(&markdown_path, b"")
            .await
            .map_err(|e| write_failed(&markdown_path, e))?;

        debug!("output directory ready: {}", root.display());
        Ok(Self {
            root,
            markdown_path,
            images_dir,
            batches_written: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn markdown_path(&self) -> &Path {
        &self.markdown_path
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Append one batch's markdown in a single write. Empty text is skipped.
    pub async fn append_batch(&mut self, markdown: &str) -> Result<(), PipelineError> {
        let body = markdown.trim_matches('\n');
        if body.is_empty() {
            return Ok(());
        }
        let mut chunk = String::with_capacity(body.len() + 2);
        if self.batches_written > 0 {
            chunk.push_str("\n\n");
        }
        chunk.push_str(body);

        let path = &self.markdown_path;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| write_failed(path, e))?;
        file.write_all(chunk.as_bytes())
            .await
            .map_err(|e| write_failed(path, e))?;
        file.flush().await.map_err(|e| write_failed(path, e))?;

        self.batches_written += 1;
        Ok(())
    }

    /// Write the final newline once the job is over.
    pub async fn finish(&self) -> Result<(), PipelineError> {
        if self.batches_written == 0 {
            return Ok(());
        }
        let path = &self.markdown_path;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| write_failed(path, e))?;
        file.write_all(b"\n").await.map_err(|e| write_failed(path, e))?;
        file.flush().await.map_err(|e| write_failed(path, e))
    }

    /// Write a figure atomically and return its final path.
    pub async fn save_image(&self, image: &ExtractedImage) -> Result<PathBuf, PipelineError> {
        let target = self.images_dir.join(format!("{}.png", image.file_stem()));
        let dir = self.images_dir.clone();
        let bytes = image.bytes.clone();
        let dest = target.clone();

        tokio::task::spawn_blocking(move || -> Result<(), PipelineError> {
            let mut tmp =
                tempfile::NamedTempFile::new_in(&dir).map_err(|e| write_failed(&dest, e))?;
            tmp.write_all(&bytes).map_err(|e| write_failed(&dest, e))?;
            tmp.persist(&dest).map_err(|e| write_failed(&dest, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Image write task panicked: {e}")))??;

        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::figures::BBox;
    use tempfile::TempDir;

    #[test]
    fn output_dir_naming() {
        assert_eq!(
            output_dir_for(Path::new("/data/report.pdf"), None),
            PathBuf::from("/data/report_converted")
        );
        assert_eq!(
            output_dir_for(Path::new("/data/report.pdf"), Some(Path::new("/out"))),
            PathBuf::from("/out/report_converted")
        );
    }

    #[tokio::test]
    async fn batches_are_appended_in_call_order() {
        let tmp = TempDir::new().unwrap();
        let mut w = OutputWriter::create(tmp.path().join("doc_converted")).await.unwrap();
        w.append_batch("# One\n").await.unwrap();
        w.append_batch("").await.unwrap();
        w.append_batch("two").await.unwrap();
        w.finish().await.unwrap();
        let md = std::fs::read_to_string(w.markdown_path()).unwrap();
        assert_eq!(md, "# One\n\ntwo\n");
    }

    #[tokio::test]
    async fn create_truncates_previous_output() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("x_converted");
        let mut w = OutputWriter::create(&root).await.unwrap();
        w.append_batch("old").await.unwrap();
        let w = OutputWriter::create(&root).await.unwrap();
        assert_eq!(std::fs::read_to_string(w.markdown_path()).unwrap(), "");
    }

    #[tokio::test]
    async fn images_land_under_images_dir() {
        let tmp = TempDir::new().unwrap();
        let w = OutputWriter::create(tmp.path().join("d_converted")).await.unwrap();
        let img = ExtractedImage {
            page_num: 12,
            fig_number: 2,
            bbox: BBox {
                x0: 0,
                y0: 0,
                x1: 1,
                y1: 1,
            },
            caption: String::new(),
            element_type: "chart".into(),
            bytes: vec![1, 2, 3],
        };
        let path = w.save_image(&img).await.unwrap();
        assert_eq!(path, w.images_dir().join("12_fig2.png"));
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        let leftovers = std::fs::read_dir(w.images_dir()).unwrap().count();
        assert_eq!(leftovers, 1, "temp file should have been renamed");
    }
}
