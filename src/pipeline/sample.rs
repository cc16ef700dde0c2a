//! Sample loading: resolve a target to its statement PDF and reference CSV.
//!
//! A target `t` names the pair `{data_dir}/t/t_sample.pdf` and
//! `{data_dir}/t/t_sample.csv`. Both files are checked up front (existence,
//! read permission, `%PDF` magic, table shape) so a bad sample fails before
//! any model call is made.

use crate::config::AgentConfig;
use crate::error::ParseGenError;
use crate::model::PageImage;
use crate::pipeline::render;
use crate::pipeline::render::DocumentText;
use crate::table::Table;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The sample statement a parser is generated against.
#[derive(Debug, Clone)]
pub struct SampleDocument {
    pub target: String,
    pub pdf_path: PathBuf,
    /// Raw PDF bytes, staged into every sandbox run.
    pub bytes: Vec<u8>,
    pub text: DocumentText,
    /// Rendered first pages, only when `attach_page_images` is set.
    pub images: Vec<PageImage>,
}

impl SampleDocument {
    /// A document with no extracted text or images.
    pub fn new(target: impl Into<String>, pdf_path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            target: target.into(),
            pdf_path: pdf_path.into(),
            bytes,
            text: DocumentText::default(),
            images: Vec::new(),
        }
    }
}

/// Paths that make up one target's sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePaths {
    pub target: String,
    pub pdf: PathBuf,
    pub csv: PathBuf,
}

impl SamplePaths {
    pub fn resolve(data_dir: &Path, target: &str) -> Result<Self, ParseGenError> {
        let target = normalize_target(target)?;
        let dir = data_dir.join(&target);
        Ok(Self {
            pdf: dir.join(format!("{target}_sample.pdf")),
            csv: dir.join(format!("{target}_sample.csv")),
            target,
        })
    }
}

/// Lowercase the target and reject anything that is not `[a-z0-9_-]+`.
pub fn normalize_target(target: &str) -> Result<String, ParseGenError> {
    let t = target.trim().to_ascii_lowercase();
    let valid = !t.is_empty()
        && t
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(t)
    } else {
        Err(ParseGenError::InvalidTarget {
            target: target.to_string(),
        })
    }
}

/// Load and validate a target's sample pair, then gather prompt context.
pub async fn load_sample(
    target: &str,
    config: &AgentConfig,
) -> Result<(SampleDocument, Table), ParseGenError> {
    let paths = SamplePaths::resolve(&config.data_dir, target)?;
    info!("Loading sample for '{}'", paths.target);

    if !paths.pdf.is_file() || !paths.csv.is_file() {
        return Err(ParseGenError::TargetNotFound {
            target: paths.target.clone(),
            pdf: paths.pdf.clone(),
            csv: paths.csv.clone(),
        });
    }

    let bytes = read_pdf(&paths.pdf)?;
    let reference = read_reference(&paths.csv)?;
    debug!(
        "Reference: {} columns, {} rows",
        reference.columns().len(),
        reference.row_count()
    );

    let text = render::extract_text(
        &paths.pdf,
        config.prompt_text_pages,
        config.pdfium_lib_path.clone(),
    )
    .await;

    let images = if config.attach_page_images {
        page_images(&paths.pdf, config).await
    } else {
        Vec::new()
    };

    Ok((
        SampleDocument {
            target: paths.target,
            pdf_path: paths.pdf,
            bytes,
            text,
            images,
        },
        reference,
    ))
}

/// Read the PDF and check its magic bytes.
fn read_pdf(path: &Path) -> Result<Vec<u8>, ParseGenError> {
    let mut file = open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| io_error(path, e))?;

    if !bytes.starts_with(b"%PDF") {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(ParseGenError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(bytes)
}

/// Read the reference CSV. It must have a header and at least one row.
fn read_reference(path: &Path) -> Result<Table, ParseGenError> {
    let file = open(path)?;
    let table = Table::from_csv_reader(file).map_err(|e| ParseGenError::MalformedReference {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    if table.is_empty() {
        return Err(ParseGenError::MalformedReference {
            path: path.to_path_buf(),
            detail: "the table has a header but no data rows".to_string(),
        });
    }
    Ok(table)
}

fn open(path: &Path) -> Result<std::fs::File, ParseGenError> {
    std::fs::File::open(path).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> ParseGenError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ParseGenError::PermissionDenied {
            path: path.to_path_buf(),
        }
    } else {
        ParseGenError::Internal(format!("reading '{}': {e}", path.display()))
    }
}

async fn page_images(pdf_path: &Path, config: &AgentConfig) -> Vec<PageImage> {
    let rendered = match render::render_pages(
        pdf_path,
        config.prompt_text_pages,
        config.image_max_pixels,
        config.pdfium_lib_path.clone(),
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!("Page images unavailable, continuing with text only: {}", e);
            return Vec::new();
        }
    };

    rendered
        .iter()
        .filter_map(|(idx, img)| match PageImage::png(img) {
            Ok(page) => {
                debug!("Page {} image: {} bytes base64", idx + 1, page.data_b64.len());
                Some(page)
            }
            Err(e) => {
                warn!("Failed to encode page {}: {}", idx + 1, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sample(dir: &Path, target: &str, pdf: &[u8], csv: &str) {
        let d = dir.join(target);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join(format!("{target}_sample.pdf")), pdf).unwrap();
        std::fs::write(d.join(format!("{target}_sample.csv")), csv).unwrap();
    }

    fn config(dir: &Path) -> AgentConfig {
        AgentConfig::builder().data_dir(dir).build().unwrap()
    }

    #[test]
    fn target_is_lowercased() {
        assert_eq!(normalize_target(" ICICI ").unwrap(), "icici");
    }

    #[test]
    fn path_traversal_is_rejected() {
        for bad in ["../etc", "a/b", "", "sbi bank", "x.y"] {
            assert!(
                matches!(normalize_target(bad), Err(ParseGenError::InvalidTarget { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn paths_follow_layout() {
        let p = SamplePaths::resolve(Path::new("data"), "icici").unwrap();
        assert_eq!(p.pdf, PathBuf::from("data/icici/icici_sample.pdf"));
        assert_eq!(p.csv, PathBuf::from("data/icici/icici_sample.csv"));
    }

    #[tokio::test]
    async fn missing_target_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_sample("nobank", &config(dir.path())).await.unwrap_err();
        assert!(matches!(err, ParseGenError::TargetNotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_csv_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path().join("sbi");
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("sbi_sample.pdf"), b"%PDF-1.4").unwrap();
        let err = load_sample("sbi", &config(dir.path())).await.unwrap_err();
        assert!(matches!(err, ParseGenError::TargetNotFound { .. }));
    }

    #[tokio::test]
    async fn non_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "hdfc", b"<html>", "a\n1\n");
        let err = load_sample("hdfc", &config(dir.path())).await.unwrap_err();
        match err {
            ParseGenError::NotAPdf { magic, .. } => assert_eq!(&magic, b"<htm"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_only_reference_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "axis", b"%PDF-1.4\n", "Date,Amount\n");
        let err = load_sample("axis", &config(dir.path())).await.unwrap_err();
        assert!(matches!(err, ParseGenError::MalformedReference { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn ragged_reference_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "kotak", b"%PDF-1.4\n", "a,b\n1\n");
        let err = load_sample("kotak", &config(dir.path())).await.unwrap_err();
        assert!(matches!(err, ParseGenError::MalformedReference { .. }));
    }

    #[tokio::test]
    async fn valid_sample_loads_even_without_text() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "icici", b"%PDF-1.4\n%%EOF\n", "Date,Amount\n01-08-2024,100.00\n");
        let (doc, reference) = load_sample("ICICI", &config(dir.path())).await.unwrap();
        assert_eq!(doc.target, "icici");
        assert!(doc.bytes.starts_with(b"%PDF"));
        assert_eq!(reference.row_count(), 1);
        assert!(doc.images.is_empty());
    }
}
