use std::{fs::{self, File}, io::{self, BufWriter, Write}, path::{Path, PathBuf}};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{GeneratorError, Result};

pub const COCO_TRAIN_IMAGES: &str = "http://images.cocodataset.org/zips/train2017.zip";
pub const COCO_VAL_IMAGES: &str = "http://images.cocodataset.org/zips/val2017.zip";
pub const COCO_ANNOTATIONS: &str = "http://images.cocodataset.org/annotations/annotations_trainval2017.zip";

/// Where the archive of `url` is kept next to `local` until it is extracted.
pub fn archive_path(url: &str, local: &Path) -> PathBuf {
    let name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download.zip");
    parent(local).join(name)
}

fn parent(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Makes sure `local` exists, downloading the zip archive at `url` and
/// unpacking it into the parent of `local` when it does not.
///
/// The archive is expected to contain `local`'s file name as its top-level
/// entry, the way the COCO archives do. An archive already sitting at
/// [`archive_path`] is reused instead of downloaded again. Returns whether
/// anything was extracted.
pub fn ensure_extracted(url: &str, local: &Path) -> Result<bool> {
    if local.exists() {
        debug!("{} already present", local.display());
        return Ok(false);
    }

    let root = parent(local);
    fs::create_dir_all(root).map_err(GeneratorError::io(root))?;

    let archive = archive_path(url, local);
    if !archive.is_file() {
        download(url, &archive)?;
    }
    extract(&archive, root)?;

    if !local.exists() {
        return Err(GeneratorError::MissingFromArchive {
            archive,
            expected: local.to_path_buf(),
        });
    }
    fs::remove_file(&archive).map_err(GeneratorError::io(&archive))?;
    Ok(true)
}

/// Streams `url` into `destination`. The body goes to a `.part` file first,
/// so an interrupted download never looks complete.
pub fn download(url: &str, destination: &Path) -> Result<()> {
    info!("Downloading {} to {}", url, destination.display());

    let response = ureq::get(url)
        .call()
        .map_err(|source| GeneratorError::Download {
            url: url.to_string(),
            source: Box::new(source),
        })?;
    let length = response
        .header("Content-Length")
        .and_then(|length| length.parse::<u64>().ok());

    let progress = match length {
        Some(length) => ProgressBar::new(length),
        None => ProgressBar::new_spinner(),
    };
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} [{elapsed}<{eta}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let partial = destination.with_extension("part");
    let file = File::create(&partial).map_err(GeneratorError::io(&partial))?;
    let mut writer = BufWriter::new(file);
    io::copy(&mut progress.wrap_read(response.into_reader()), &mut writer)
        .and_then(|_| writer.flush())
        .map_err(GeneratorError::io(&partial))?;
    progress.finish_and_clear();

    fs::rename(&partial, destination).map_err(GeneratorError::io(destination))?;
    Ok(())
}

/// Unpacks every entry of the zip file `archive` under `root`.
pub fn extract(archive: &Path, root: &Path) -> Result<()> {
    info!("Extracting {} into {}", archive.display(), root.display());

    let file = File::open(archive).map_err(GeneratorError::io(archive))?;
    ZipArchive::new(file)
        .and_then(|mut zip| zip.extract(root))
        .map_err(GeneratorError::archive(archive))
}
