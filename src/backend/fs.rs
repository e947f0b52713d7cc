//! Reference backend over a local directory tree. Objects are sharded
//! into subdirectories keyed by the first two hex characters of their MAC
//! to avoid huge flat directories.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_stream::{wrappers::ReadDirStream, StreamExt};

use super::{Backend, BackendError, BackendFactory};
use crate::resource::{Mac, MAC_SIZE};

const CONFIG_OBJECT: &str = "CONFIG";
const STATES_FOLDER: &str = "states";
const PACKFILES_FOLDER: &str = "packfiles";
const LOCKS_FOLDER: &str = "locks";

pub struct FsBackend {
    root: PathBuf,
}

pub struct FsFactory;

impl BackendFactory for FsFactory {
    fn open(&self, location: &str) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(FsBackend::new(location)))
    }
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, namespace: &str, mac: Mac) -> PathBuf {
        let hex = mac.to_string();
        self.root.join(namespace).join(&hex[..2]).join(hex)
    }

    async fn put_object(
        &self,
        namespace: &str,
        mac: Mac,
        data: &[u8],
    ) -> Result<u64, BackendError> {
        let hex = mac.to_string();
        let directory = self.root.join(namespace).join(&hex[..2]);
        fs::create_dir_all(&directory).await?;

        // objects are immutable; a same-MAC race means identical bytes
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(directory.join(hex))
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(data.len() as u64)
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn get_object(&self, namespace: &str, mac: Mac) -> Result<Vec<u8>, BackendError> {
        Ok(fs::read(self.object_path(namespace, mac)).await?)
    }

    async fn delete_object(&self, namespace: &str, mac: Mac) -> Result<(), BackendError> {
        Ok(fs::remove_file(self.object_path(namespace, mac)).await?)
    }

    async fn list_objects(&self, namespace: &str) -> Result<Vec<Mac>, BackendError> {
        let folder = self.root.join(namespace);
        let mut macs = Vec::new();

        let mut shards = ReadDirStream::new(fs::read_dir(&folder).await?);
        while let Some(shard) = shards.next().await {
            let shard = shard?;
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut objects = ReadDirStream::new(fs::read_dir(shard.path()).await?);
            while let Some(object) = objects.next().await {
                // ignore files that don't match our naming pattern
                if let Some(mac) = parse_object_name(&object?.file_name()) {
                    macs.push(mac);
                }
            }
        }

        Ok(macs)
    }

    async fn folder_size(&self, path: &Path) -> Result<i64, BackendError> {
        let mut total = 0i64;
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = ReadDirStream::new(fs::read_dir(&dir).await?);
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len() as i64;
                }
            }
        }
        Ok(total)
    }
}

fn parse_object_name(name: &std::ffi::OsStr) -> Option<Mac> {
    let name = name.to_str()?;
    if name.len() != MAC_SIZE * 2 {
        return None;
    }
    let bytes = hex::decode(name).ok()?;
    Mac::from_slice(&bytes).ok()
}

#[async_trait]
impl Backend for FsBackend {
    async fn create(&self, config: &[u8]) -> Result<(), BackendError> {
        fs::create_dir_all(&self.root).await?;
        for namespace in [STATES_FOLDER, PACKFILES_FOLDER, LOCKS_FOLDER] {
            fs::create_dir_all(self.root.join(namespace)).await?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.root.join(CONFIG_OBJECT))
            .await?;
        file.write_all(config).await?;
        file.flush().await?;
        Ok(())
    }

    async fn open(&self) -> Result<Vec<u8>, BackendError> {
        Ok(fs::read(self.root.join(CONFIG_OBJECT)).await?)
    }

    async fn get_states(&self) -> Result<Vec<Mac>, BackendError> {
        self.list_objects(STATES_FOLDER).await
    }

    async fn put_state(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        self.put_object(STATES_FOLDER, mac, data).await
    }

    async fn get_state(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        self.get_object(STATES_FOLDER, mac).await
    }

    async fn delete_state(&self, mac: Mac) -> Result<(), BackendError> {
        self.delete_object(STATES_FOLDER, mac).await
    }

    async fn get_packfiles(&self) -> Result<Vec<Mac>, BackendError> {
        self.list_objects(PACKFILES_FOLDER).await
    }

    async fn put_packfile(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        self.put_object(PACKFILES_FOLDER, mac, data).await
    }

    async fn get_packfile(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        self.get_object(PACKFILES_FOLDER, mac).await
    }

    async fn get_packfile_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> Result<Vec<u8>, BackendError> {
        let mut file = File::open(self.object_path(PACKFILES_FOLDER, mac)).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; length as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn delete_packfile(&self, mac: Mac) -> Result<(), BackendError> {
        self.delete_object(PACKFILES_FOLDER, mac).await
    }

    async fn get_locks(&self) -> Result<Vec<Mac>, BackendError> {
        self.list_objects(LOCKS_FOLDER).await
    }

    async fn put_lock(&self, mac: Mac, data: &[u8]) -> Result<u64, BackendError> {
        self.put_object(LOCKS_FOLDER, mac, data).await
    }

    async fn get_lock(&self, mac: Mac) -> Result<Vec<u8>, BackendError> {
        self.get_object(LOCKS_FOLDER, mac).await
    }

    async fn delete_lock(&self, mac: Mac) -> Result<(), BackendError> {
        self.delete_object(LOCKS_FOLDER, mac).await
    }

    async fn size(&self) -> Result<i64, BackendError> {
        self.folder_size(&self.root).await
    }
}
