use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AssemblyError, Result};

const CONTENT_TYPES: &str = "[Content_Types].xml";

/// One zip entry as it was found at unpack time. The bytes live on disk.
#[derive(Clone, Debug)]
pub struct EntryMeta {
    pub name: String,
    pub compression: CompressionMethod,
    pub last_modified: zip::DateTime,
    pub unix_mode: Option<u32>,
    pub is_dir: bool,
}

/// Unpacked container owned by exactly one assembly run.
///
/// The directory is removed recursively when the tree is dropped, whether the run
/// succeeded or not.
#[derive(Debug)]
pub struct WorkingTree {
    root: PathBuf,
    entries: Vec<EntryMeta>,
}

impl WorkingTree {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[EntryMeta] {
        &self.entries
    }

    pub fn part_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.entries.iter().any(|e| !e.is_dir && e.name == name)
    }

    /// File names of manifest parts that live directly under `dir` (e.g. `word`).
    pub fn part_names_in(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.entries
            .iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| e.name.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| format!("{prefix}{rest}"))
            .collect()
    }

    pub fn read_part(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.part_path(name);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AssemblyError::PartMissing(name.to_string()),
            _ => AssemblyError::io(format!("read part: {}", path.display()), e),
        })
    }

    pub fn write_part(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.part_path(name);
        fs::write(&path, data)
            .map_err(|e| AssemblyError::io(format!("write part: {}", path.display()), e))
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        if !self.root.exists() {
            return;
        }
        match fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(dir = %self.root.display(), "removed working tree"),
            Err(e) => {
                warn!(dir = %self.root.display(), error = %e, "could not remove working tree")
            }
        }
    }
}

/// Extract every entry of `container` into `work_dir`, keeping relative paths exactly.
pub fn unpack(container: &Path, work_dir: &Path) -> Result<WorkingTree> {
    if !container.is_file() {
        return Err(AssemblyError::TemplateMissing(container.to_path_buf()));
    }
    let f = File::open(container)
        .map_err(|e| AssemblyError::io(format!("open container: {}", container.display()), e))?;
    let mut zip = ZipArchive::new(f).map_err(|source| AssemblyError::ArchiveCorrupt {
        path: container.to_path_buf(),
        source,
    })?;

    if work_dir.exists() {
        // Leftover from an aborted run writing the same output.
        fs::remove_dir_all(work_dir).map_err(|e| {
            AssemblyError::io(format!("clear stale working tree: {}", work_dir.display()), e)
        })?;
    }
    fs::create_dir_all(work_dir)
        .map_err(|e| AssemblyError::io(format!("create working tree: {}", work_dir.display()), e))?;

    let mut tree = WorkingTree {
        root: work_dir.to_path_buf(),
        entries: Vec::with_capacity(zip.len()),
    };

    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(|source| AssemblyError::ArchiveCorrupt {
            path: container.to_path_buf(),
            source,
        })?;
        let name = file.name().to_string();
        let rel = file.enclosed_name().ok_or_else(|| {
            AssemblyError::io(
                format!("unsafe entry name in {}", container.display()),
                io::Error::new(io::ErrorKind::InvalidData, name.clone()),
            )
        })?;
        let dest = work_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&dest)
                .map_err(|e| AssemblyError::io(format!("create dir: {}", dest.display()), e))?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    AssemblyError::io(format!("create dir: {}", parent.display()), e)
                })?;
            }
            let mut out = File::create(&dest)
                .map_err(|e| AssemblyError::io(format!("create file: {}", dest.display()), e))?;
            io::copy(&mut file, &mut out)
                .map_err(|e| AssemblyError::io(format!("extract entry: {name}"), e))?;
        }
        tree.entries.push(EntryMeta {
            name,
            compression: file.compression(),
            last_modified: file.last_modified().unwrap_or_default(),
            unix_mode: file.unix_mode(),
            is_dir: file.is_dir(),
        });
    }
    debug!(
        container = %container.display(),
        entries = tree.entries.len(),
        "unpacked container"
    );
    Ok(tree)
}

/// Write the working tree back into a new container, entry for entry in unpack order.
pub fn pack(tree: &WorkingTree, container: &Path) -> Result<()> {
    let mut zout = create_writer(container)?;
    for ent in &tree.entries {
        let mut opts = SimpleFileOptions::default()
            .compression_method(ent.compression)
            .last_modified_time(ent.last_modified);
        if let Some(mode) = ent.unix_mode {
            opts = opts.unix_permissions(mode);
        }
        if ent.is_dir || ent.name.ends_with('/') {
            zout.add_directory(ent.name.as_str(), opts)
                .map_err(|e| zip_write_error(&ent.name, e))?;
            continue;
        }
        let data = tree.read_part(&ent.name)?;
        zout.start_file(ent.name.as_str(), opts)
            .map_err(|e| zip_write_error(&ent.name, e))?;
        zout.write_all(&data)
            .map_err(|e| AssemblyError::io(format!("write zip entry: {}", ent.name), e))?;
    }
    zout.finish()
        .map_err(|e| zip_write_error(&container.display().to_string(), e))?;

    let known: HashSet<&str> = tree.entries.iter().map(|e| e.name.as_str()).collect();
    for rel in relative_files(&tree.root)? {
        if !known.contains(rel.as_str()) {
            warn!(file = %rel, "file in working tree is not part of the container; not packed");
        }
    }
    Ok(())
}

/// Pack an arbitrary directory. `[Content_Types].xml` goes first, the rest in lexical order.
pub fn pack_dir(work_dir: &Path, container: &Path) -> Result<()> {
    let mut names = relative_files(work_dir)?;
    names.sort_by(|a, b| {
        (a.as_str() != CONTENT_TYPES, a.as_str()).cmp(&(b.as_str() != CONTENT_TYPES, b.as_str()))
    });
    let mut zout = create_writer(container)?;
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for name in &names {
        let path = work_dir.join(name);
        let data = fs::read(&path)
            .map_err(|e| AssemblyError::io(format!("read file: {}", path.display()), e))?;
        zout.start_file(name.as_str(), opts)
            .map_err(|e| zip_write_error(name, e))?;
        zout.write_all(&data)
            .map_err(|e| AssemblyError::io(format!("write zip entry: {name}"), e))?;
    }
    zout.finish()
        .map_err(|e| zip_write_error(&container.display().to_string(), e))?;
    Ok(())
}

/// Read every file entry of a container into memory, in archive order.
pub fn read_entries(container: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let f = File::open(container)
        .map_err(|e| AssemblyError::io(format!("open container: {}", container.display()), e))?;
    let corrupt = |source| AssemblyError::ArchiveCorrupt {
        path: container.to_path_buf(),
        source,
    };
    let mut zip = ZipArchive::new(f).map_err(corrupt)?;
    let mut out = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(corrupt)?;
        if file.is_dir() {
            continue;
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| AssemblyError::io(format!("read zip entry: {}", file.name()), e))?;
        out.push((file.name().to_string(), data));
    }
    Ok(out)
}

fn create_writer(container: &Path) -> Result<ZipWriter<File>> {
    if let Some(parent) = container.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| AssemblyError::io(format!("create dir: {}", parent.display()), e))?;
    }
    let f = File::create(container)
        .map_err(|e| AssemblyError::io(format!("create container: {}", container.display()), e))?;
    Ok(ZipWriter::new(f))
}

fn zip_write_error(what: &str, e: zip::result::ZipError) -> AssemblyError {
    AssemblyError::io(format!("write zip: {what}"), io::Error::other(e))
}

fn relative_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AssemblyError::io(format!("walk working tree: {}", root.display()), e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(name);
    }
    Ok(out)
}
