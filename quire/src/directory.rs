use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::Error;

/// Name of the lock file guarding single-writer access to a directory.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Flat storage of named files an index lives in.
pub trait Directory: Send + Sync + fmt::Debug {
    /// Creates (or truncates) a file and returns a stream writing to it.
    fn create(&self, name: &str) -> Result<Box<dyn Write + Send>, Error>;
    /// Reads the whole file.
    fn open(&self, name: &str) -> Result<Vec<u8>, Error>;
    fn exists(&self, name: &str) -> Result<bool, Error>;
    fn length(&self, name: &str) -> Result<u64, Error>;
    fn remove(&self, name: &str) -> Result<(), Error>;
    fn rename(&self, from: &str, to: &str) -> Result<(), Error>;
    /// Makes the file durable.
    fn sync(&self, name: &str) -> Result<(), Error>;
    fn list(&self) -> Result<Vec<String>, Error>;
    fn make_lock(&self, name: &str) -> Result<Box<dyn DirectoryLock>, Error>;
}

/// An exclusive lock. Released on `unlock` or drop.
pub trait DirectoryLock: Send {
    fn try_lock(&mut self) -> Result<bool, Error>;
    fn unlock(&mut self) -> Result<(), Error>;
}

/// Files which look like they were written by an index: segment files, index states and
/// pending index states.
pub fn is_index_file(name: &str) -> bool {
    name.starts_with('_') || name.starts_with("segments_") || name.starts_with("pending_segments_")
}

/// Removes every index file of the directory which is not in `referenced`. Returns the number of
/// removed files. Failing removals are skipped.
pub fn remove_unreferenced(
    dir: &dyn Directory,
    referenced: &HashSet<String>,
) -> Result<usize, Error> {
    let mut removed = 0;
    for name in dir.list()? {
        if name == WRITE_LOCK_NAME || !is_index_file(&name) || referenced.contains(&name) {
            continue;
        }
        match dir.remove(&name) {
            Ok(()) => {
                trace!(file = %name, "removed unreferenced file");
                removed += 1;
            }
            Err(e) => debug!(file = %name, error = %e, "could not remove unreferenced file"),
        }
    }
    Ok(removed)
}

/// Removes every file of the segment `segment`, whatever state its writing got to.
pub fn remove_segment_files(dir: &dyn Directory, segment: &str) {
    let prefix = format!("{}.", segment);
    let names = match dir.list() {
        Ok(names) => names,
        Err(e) => {
            debug!(segment = %segment, error = %e, "could not list segment files");
            return;
        }
    };
    for name in names.iter().filter(|n| n.starts_with(&prefix)) {
        if let Err(e) = dir.remove(name) {
            debug!(file = %name, error = %e, "could not remove segment file");
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsDirectory {
    path: PathBuf,
}

impl FsDirectory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FsDirectory, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(FsDirectory { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), Error> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn Write + Send>, Error> {
        Ok(Box::new(BufWriter::new(File::create(self.file(name))?)))
    }

    fn open(&self, name: &str) -> Result<Vec<u8>, Error> {
        Ok(fs::read(self.file(name))?)
    }

    fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.file(name).exists())
    }

    fn length(&self, name: &str) -> Result<u64, Error> {
        Ok(fs::metadata(self.file(name))?.len())
    }

    fn remove(&self, name: &str) -> Result<(), Error> {
        Ok(fs::remove_file(self.file(name))?)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        fs::rename(self.file(from), self.file(to))?;
        self.sync_dir()
    }

    fn sync(&self, name: &str) -> Result<(), Error> {
        OpenOptions::new()
            .read(true)
            .open(self.file(name))?
            .sync_all()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.path).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::Other(Box::new(e)))?;
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn DirectoryLock>, Error> {
        Ok(Box::new(FsLock {
            path: self.file(name),
            file: None,
        }))
    }
}

struct FsLock {
    path: PathBuf,
    file: Option<File>,
}

impl DirectoryLock for FsLock {
    fn try_lock(&mut self) -> Result<bool, Error> {
        if self.file.is_some() {
            return Ok(true);
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(ref e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
        }
        Ok(())
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

type Failure = Box<dyn Fn(&str) -> bool + Send>;

#[derive(Default)]
struct MemoryFiles {
    files: HashMap<String, Vec<u8>>,
    locks: HashSet<String>,
    fail_sync: Option<Failure>,
    fail_create: Option<Failure>,
}

/// A directory kept in memory. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<MemoryFiles>>,
}

impl fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryDirectory")
            .field("files", &inner.files.len())
            .finish()
    }
}

impl MemoryDirectory {
    pub fn new() -> MemoryDirectory {
        MemoryDirectory::default()
    }

    /// Makes `sync` fail for every file name matching `predicate`.
    pub fn fail_sync_on<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        self.inner.lock().fail_sync = Some(Box::new(predicate));
    }

    /// Makes `create` fail for every file name matching `predicate`.
    pub fn fail_create_on<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        self.inner.lock().fail_create = Some(Box::new(predicate));
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.fail_sync = None;
        inner.fail_create = None;
    }

    /// Snapshot of a file's content, `None` if it does not exist.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(name).cloned()
    }

    fn not_found(name: &str) -> Error {
        Error::from(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such file '{}'", name),
        ))
    }
}

struct MemoryOutput {
    inner: Arc<Mutex<MemoryFiles>>,
    name: String,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner
            .files
            .entry(self.name.clone())
            .or_insert_with(Vec::new)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Directory for MemoryDirectory {
    fn create(&self, name: &str) -> Result<Box<dyn Write + Send>, Error> {
        let mut inner = self.inner.lock();
        if let Some(ref fail) = inner.fail_create {
            if fail(name) {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected create failure for '{}'", name),
                )));
            }
        }
        inner.files.insert(name.to_string(), Vec::new());
        drop(inner);
        Ok(Box::new(MemoryOutput {
            inner: self.inner.clone(),
            name: name.to_string(),
        }))
    }

    fn open(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.contents(name).ok_or_else(|| MemoryDirectory::not_found(name))
    }

    fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.inner.lock().files.contains_key(name))
    }

    fn length(&self, name: &str) -> Result<u64, Error> {
        self.inner
            .lock()
            .files
            .get(name)
            .map(|f| f.len() as u64)
            .ok_or_else(|| MemoryDirectory::not_found(name))
    }

    fn remove(&self, name: &str) -> Result<(), Error> {
        match self.inner.lock().files.remove(name) {
            Some(_) => Ok(()),
            None => Err(MemoryDirectory::not_found(name)),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        match inner.files.remove(from) {
            Some(content) => {
                inner.files.insert(to.to_string(), content);
                Ok(())
            }
            None => Err(MemoryDirectory::not_found(from)),
        }
    }

    fn sync(&self, name: &str) -> Result<(), Error> {
        let inner = self.inner.lock();
        if let Some(ref fail) = inner.fail_sync {
            if fail(name) {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected sync failure for '{}'", name),
                )));
            }
        }
        if inner.files.contains_key(name) {
            Ok(())
        } else {
            Err(MemoryDirectory::not_found(name))
        }
    }

    fn list(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.lock().files.keys().cloned().collect())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn DirectoryLock>, Error> {
        Ok(Box::new(MemoryLock {
            inner: self.inner.clone(),
            name: name.to_string(),
            locked: false,
        }))
    }
}

struct MemoryLock {
    inner: Arc<Mutex<MemoryFiles>>,
    name: String,
    locked: bool,
}

impl DirectoryLock for MemoryLock {
    fn try_lock(&mut self) -> Result<bool, Error> {
        if !self.locked {
            self.locked = self.inner.lock().locks.insert(self.name.clone());
        }
        Ok(self.locked)
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if self.locked {
            self.inner.lock().locks.remove(&self.name);
            self.locked = false;
        }
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &dyn Directory, name: &str, content: &[u8]) {
        let mut out = dir.create(name).unwrap();
        out.write_all(content).unwrap();
        out.flush().unwrap();
    }

    fn exercise(dir: &dyn Directory) {
        write_file(dir, "_1.doc", b"postings");
        assert!(dir.exists("_1.doc").unwrap());
        assert_eq!(8, dir.length("_1.doc").unwrap());
        assert_eq!(b"postings".to_vec(), dir.open("_1.doc").unwrap());
        dir.sync("_1.doc").unwrap();
        dir.rename("_1.doc", "_2.doc").unwrap();
        assert!(!dir.exists("_1.doc").unwrap());
        assert_eq!(vec!["_2.doc".to_string()], dir.list().unwrap());
        dir.remove("_2.doc").unwrap();
        assert!(dir.list().unwrap().is_empty());
        assert!(dir.open("_2.doc").is_err());
    }

    #[test]
    fn memory_directory_behaves_like_a_directory() {
        exercise(&MemoryDirectory::new());
    }

    #[test]
    fn fs_directory_behaves_like_a_directory() {
        let tmp = TempDir::new().unwrap();
        exercise(&FsDirectory::open(tmp.path()).unwrap());
    }

    #[test]
    fn injected_sync_failure() {
        let dir = MemoryDirectory::new();
        write_file(&dir, "_1.doc", b"x");
        dir.fail_sync_on(|name| name.ends_with(".doc"));
        assert!(dir.sync("_1.doc").is_err());
        dir.clear_failures();
        assert!(dir.sync("_1.doc").is_ok());
    }

    #[test]
    fn locks_are_exclusive() {
        let tmp = TempDir::new().unwrap();
        let first = FsDirectory::open(tmp.path()).unwrap();
        let second = FsDirectory::open(tmp.path()).unwrap();
        let mut a = first.make_lock(WRITE_LOCK_NAME).unwrap();
        let mut b = second.make_lock(WRITE_LOCK_NAME).unwrap();
        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap());
        a.unlock().unwrap();
        assert!(b.try_lock().unwrap());

        let mem = MemoryDirectory::new();
        let mut c = mem.make_lock(WRITE_LOCK_NAME).unwrap();
        assert!(c.try_lock().unwrap());
        assert!(!mem.make_lock(WRITE_LOCK_NAME).unwrap().try_lock().unwrap());
        drop(c);
        assert!(mem.make_lock(WRITE_LOCK_NAME).unwrap().try_lock().unwrap());
    }

    #[test]
    fn removes_only_unreferenced_index_files() {
        let dir = MemoryDirectory::new();
        for name in &["_1.doc", "_2.doc", "segments_1", "notes.txt", WRITE_LOCK_NAME] {
            write_file(&dir, name, b"");
        }
        let mut referenced = HashSet::new();
        referenced.insert("_1.doc".to_string());
        referenced.insert("segments_1".to_string());
        assert_eq!(1, remove_unreferenced(&dir, &referenced).unwrap());
        let mut left = dir.list().unwrap();
        left.sort();
        assert_eq!(
            vec!["_1.doc", "notes.txt", "segments_1", WRITE_LOCK_NAME],
            left.iter().map(|s| s.as_str()).collect::<Vec<_>>()
        );
    }
}
