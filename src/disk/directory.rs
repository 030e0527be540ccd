use std::{num::NonZeroUsize, path::Path};
use crate::layout::FileEntry;
use super::{worker::WorkerHandle, Result};

/// Owns one worker per payload file and keeps the number of open file
/// handles converging to the configured budget with an LRU over files.
///
/// Close is asynchronous, so the count may transiently overshoot; only
/// steady state is bounded.
#[derive(Debug)]
pub struct FileDirectory {

    workers: Vec<WorkerHandle>,

    open: lru::LruCache<usize, ()>,

}

impl FileDirectory {

    // Creates missing directories and spawns the per-file workers.
    pub fn new(root: &Path, files: &[FileEntry], max_open: usize) -> Result<Self> {

        if !root.is_dir() {
            std::fs::create_dir_all(root)?;
            tracing::info!("created missing download directory: {:?}", root);
        }

        debug_assert!(!files.is_empty());
        let mut workers = Vec::with_capacity(files.len());
        for entry in files {
            let path = root.join(&entry.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            workers.push(WorkerHandle::spawn(path));
        }

        let open = lru::LruCache::new(NonZeroUsize::new(max_open.max(1)).unwrap());
        Ok(Self { workers, open })
    }

    /// Makes sure `file`'s handle is open, evicting the least recently
    /// used worker's handle when the budget is full.
    pub async fn schedule_io(&mut self, file: usize) -> Result<()> {
        if self.open.get(&file).is_some() {
            return Ok(());
        }
        if self.open.len() == self.open.cap().get() {
            if let Some((victim, _)) = self.open.pop_lru() {
                tracing::trace!("closing lru file: {:?}", self.workers[victim].path);
                self.workers[victim].close();
            }
        }
        self.workers[file].open().await?;
        self.open.put(file, ());
        Ok(())
    }

    pub async fn read(&mut self, file: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.schedule_io(file).await?;
        self.workers[file].read(offset, len).await
    }

    pub async fn write(&mut self, file: usize, offset: u64, data: Vec<u8>) -> Result<()> {
        self.schedule_io(file).await?;
        self.workers[file].write(offset, data).await
    }

    pub async fn allocate(&mut self, file: usize, len: u64) -> Result<()> {
        self.schedule_io(file).await?;
        self.workers[file].allocate(len).await
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }

    #[cfg(test)]
    pub fn is_open(&self, file: usize) -> bool {
        self.open.peek(&file).is_some()
    }

    #[cfg(test)]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
