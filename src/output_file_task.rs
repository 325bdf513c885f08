// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The per-output-file task: fetch one artifact of a finished remote compile to a temp path
//! next to its final location. Tasks for one compile run concurrently; the compile task joins
//! them all before any rename happens, so a half-downloaded set never becomes visible.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use store::{BlobDownloader, BlobServiceClient, OutputFileInfo, StoreError};

use crate::remote::ExecOutputFile;

///
/// Where one downloaded artifact waits for its rename.
///
#[derive(Clone, Debug)]
pub struct DownloadedOutput {
    pub final_filename: PathBuf,
    pub tmp_filename: PathBuf,
    pub mode: u32,
}

pub fn tmp_filename_for(final_filename: &Path, task_id: u64) -> PathBuf {
    let mut name = final_filename.as_os_str().to_owned();
    name.push(format!(".tmp.{task_id}"));
    PathBuf::from(name)
}

///
/// Downloads one output (inline blob or content-addressed fetch) to its temp path. Retried once
/// by the caller on failure before the compile falls back.
///
pub async fn run_output_file_task(
    blob_client: Arc<dyn BlobServiceClient>,
    cwd: &Path,
    output: &ExecOutputFile,
    task_id: u64,
) -> Result<DownloadedOutput, StoreError> {
    let final_filename = if output.filename.is_absolute() {
        output.filename.clone()
    } else {
        cwd.join(&output.filename)
    };
    let tmp_filename = tmp_filename_for(&final_filename, task_id);

    let downloader = BlobDownloader::new(blob_client);
    let mut info =
        OutputFileInfo::to_tmp_file(final_filename.clone(), tmp_filename.clone(), output.mode);
    info.hash_key = output.hash_key;
    info.inline_blob = output.inline_blob.clone();
    downloader.download(&mut info).await?;

    debug!(
        "output {} staged at {}",
        final_filename.display(),
        tmp_filename.display()
    );
    Ok(DownloadedOutput {
        final_filename,
        tmp_filename,
        mode: output.mode,
    })
}
