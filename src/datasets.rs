//! Upload of local-path datasets at submit time. The directory (or file) is streamed to the
//! service as a gzipped tarball and referenced thereafter by the returned version id.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::client::{Method, ServiceClient};
use crate::{OsmoError, Result};

/// Uploads a local path as a new version of the named dataset and returns the version id.
///
/// The archive is staged in a temp file so the request body has a known length and the
/// directory is only walked once.
pub async fn upload_localpath_dataset(
    client: &ServiceClient,
    dataset_name: &str,
    localpath: &Path,
    workflow_name: &str,
) -> Result<String> {
    tracing::info!(
        dataset = dataset_name,
        path = %localpath.display(),
        "Uploading localpath dataset"
    );

    let staging = tempfile::NamedTempFile::new()?;
    let staging_path = staging.path().to_owned();

    let archive = tokio::fs::File::create(&staging_path).await?;
    let gz = async_compression::tokio::write::GzipEncoder::new(archive);
    let mut builder = tokio_tar::Builder::new(gz);
    if localpath.is_dir() {
        builder.append_dir_all(".", localpath).await?;
    } else {
        let file_name = localpath
            .file_name()
            .ok_or_else(|| OsmoError::user("localpath has no file name"))?;
        let mut file = tokio::fs::File::open(localpath).await?;
        builder
            .append_file(Path::new(file_name), &mut file)
            .await?;
    }
    let mut gz = builder.into_inner().await?;
    gz.shutdown().await?;

    let upload = tokio::fs::File::open(&staging_path).await?;
    let body = reqwest::Body::wrap_stream(ReaderStream::new(upload));

    let result = client
        .request_raw_body(
            Method::POST,
            &format!("api/dataset/{}/version", dataset_name),
            vec![
                ("workflow_name".to_owned(), workflow_name.to_owned()),
                (
                    "localpath".to_owned(),
                    localpath.to_string_lossy().into_owned(),
                ),
                ("localpath_dataset".to_owned(), "true".to_owned()),
            ],
            body,
            "application/gzip",
        )
        .await?;

    result
        .get("version_id")
        .and_then(|v| v.as_str())
        .map(|v| v.to_owned())
        .ok_or_else(|| OsmoError::Submission {
            message: "Failed to get version of localpath dataset upload!".to_owned(),
            workflow_id: None,
            status_code: None,
        })
}
