use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};
use tokio::{
    sync::{mpsc, oneshot},
    task,
};
use super::{DiskError, Result};

// Operations on a single file. Open/close are driven by the file
// directory's handle budget; I/O ops fail if the handle is closed and
// nothing reopened it first.
pub enum FileOp {

    Open { tx: oneshot::Sender<Result<()>> },

    Close,

    Read {
        offset: u64,
        len: usize,
        tx: oneshot::Sender<Result<Vec<u8>>>,
    },

    Write {
        offset: u64,
        data: Vec<u8>,
        tx: oneshot::Sender<Result<()>>,
    },

    // Extend the file to `len` bytes, zero-filled.
    Allocate { len: u64, tx: oneshot::Sender<Result<()>> },

    Shutdown,

}

#[derive(Debug)]
pub struct WorkerHandle {

    pub path: PathBuf,

    op_tx: mpsc::UnboundedSender<FileOp>,

}

impl WorkerHandle {

    // Spawns the worker's blocking loop; `path` must already have its
    // parent directories in place.
    pub fn spawn(path: PathBuf) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let worker = FileWorker {
            path: path.clone(),
            handle: None,
            op_rx,
        };
        task::spawn_blocking(move || worker.run());
        Self { path, op_tx }
    }

    pub async fn open(&self) -> Result<()> {
        self.request(|tx| FileOp::Open { tx }).await
    }

    // Fire-and-forget: the budget only converges, it is not exact.
    pub fn close(&self) {
        self.op_tx.send(FileOp::Close).ok();
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.request(|tx| FileOp::Read { offset, len, tx }).await
    }

    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        self.request(|tx| FileOp::Write { offset, data, tx }).await
    }

    pub async fn allocate(&self, len: u64) -> Result<()> {
        self.request(|tx| FileOp::Allocate { len, tx }).await
    }

    pub fn shutdown(&self) {
        self.op_tx.send(FileOp::Shutdown).ok();
    }

    async fn request<T>(&self, op: impl FnOnce(oneshot::Sender<Result<T>>) -> FileOp) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.op_tx
            .send(op(tx))
            .map_err(|_| DiskError::ChannelError("file worker gone".into()))?;
        rx.await
            .map_err(|_| DiskError::ChannelError("file worker dropped reply".into()))?
    }
}

struct FileWorker {

    path: PathBuf,

    // At most one open handle per file.
    handle: Option<fs::File>,

    op_rx: mpsc::UnboundedReceiver<FileOp>,

}

impl FileWorker {

    fn run(mut self) {
        while let Some(op) = self.op_rx.blocking_recv() {
            match op {

                FileOp::Open { tx } => {
                    let _ = tx.send(self.open());
                }

                FileOp::Close => {
                    self.handle = None;
                }

                FileOp::Read { offset, len, tx } => {
                    let _ = tx.send(self.read(offset, len));
                }

                FileOp::Write { offset, data, tx } => {
                    let _ = tx.send(self.write(offset, &data));
                }

                FileOp::Allocate { len, tx } => {
                    let _ = tx.send(self.allocate(len));
                }

                FileOp::Shutdown => break,

            }
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.handle.is_none() {
            tracing::trace!("opening file: {:?}", self.path);
            self.handle = Some(
                fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&self.path)?,
            );
        }
        Ok(())
    }

    fn file(&mut self) -> Result<&mut fs::File> {
        self.handle.as_mut().ok_or(DiskError::FileClosed)
    }

    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn allocate(&mut self, len: u64) -> Result<()> {
        self.file()?.set_len(len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let worker = WorkerHandle::spawn(dir.path().join("data.bin"));

        worker.open().await?;
        worker.allocate(32).await?;
        worker.write(8, vec![7; 4]).await?;

        assert_eq!(worker.read(8, 4).await?, vec![7; 4]);
        // Allocation zero-fills.
        assert_eq!(worker.read(0, 8).await?, vec![0; 8]);

        worker.close();
        worker.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_io_requires_open_handle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let worker = WorkerHandle::spawn(dir.path().join("data.bin"));
        assert!(matches!(worker.read(0, 1).await, Err(DiskError::FileClosed)));
        Ok(())
    }
}
