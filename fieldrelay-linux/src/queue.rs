//! Outbound queue: capture files waiting in a directory, drained oldest first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use fieldrelay_core::LocalIoError;

/// A capture file seen in one snapshot of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFile {
    pub name: String,
    pub path: PathBuf,
    created: SystemTime,
}

pub struct OutboundQueue {
    dir: PathBuf,
    /// Sent captures are moved here instead of deleted when set.
    sent_dir: Option<PathBuf>,
    /// Delivered but not yet taken out of the queue; never sent again.
    delivered: Mutex<HashSet<PathBuf>>,
}

impl OutboundQueue {
    pub fn new(dir: impl Into<PathBuf>, sent_dir: Option<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sent_dir,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the queue (and archive) directories if missing.
    pub async fn ensure_dirs(&self) -> Result<(), LocalIoError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LocalIoError::new("create", &self.dir, e))?;
        if let Some(sent) = &self.sent_dir {
            tokio::fs::create_dir_all(sent)
                .await
                .map_err(|e| LocalIoError::new("create", sent, e))?;
        }
        Ok(())
    }

    /// Regular files currently queued, ordered by creation time then name.
    /// Files that appear after this call are left for the next snapshot.
    pub async fn snapshot(&self) -> Result<Vec<CaptureFile>, LocalIoError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| LocalIoError::new("list", &self.dir, e))?;
        let mut files = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(LocalIoError::new("list", &self.dir, e)),
            };
            // Vanished between listing and stat: the capture engine renamed it away.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(CaptureFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path(),
                created,
            });
        }
        files.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        self.delivered_set()
            .retain(|p| files.iter().any(|f| &f.path == p));
        Ok(files)
    }

    pub async fn read(&self, file: &CaptureFile) -> Result<Vec<u8>, LocalIoError> {
        tokio::fs::read(&file.path)
            .await
            .map_err(|e| LocalIoError::new("read", &file.path, e))
    }

    /// True when `file` was already delivered and only its removal is outstanding.
    pub fn is_delivered(&self, file: &CaptureFile) -> bool {
        self.delivered_set().contains(&file.path)
    }

    /// Take a sent capture out of the queue: archive it when configured, otherwise delete it.
    /// On failure the file is remembered as delivered so later passes only retry the removal.
    pub async fn complete(&self, file: &CaptureFile) -> Result<(), LocalIoError> {
        let r = match &self.sent_dir {
            Some(sent) => archive(&file.path, &sent.join(&file.name)).await,
            None => tokio::fs::remove_file(&file.path)
                .await
                .map_err(|e| LocalIoError::new("delete", &file.path, e)),
        };
        let mut delivered = self.delivered_set();
        match &r {
            Err(e) if !e.is_not_found() => {
                delivered.insert(file.path.clone());
            }
            _ => {
                delivered.remove(&file.path);
            }
        }
        r
    }

    fn delivered_set(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Move `from` to `to`, copying across filesystems when a rename cannot.
async fn archive(from: &Path, to: &Path) -> Result<(), LocalIoError> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            tracing::debug!(from = %from.display(), to = %to.display(), "archive crosses filesystems, copying");
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| LocalIoError::new("archive", from, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| LocalIoError::new("delete", from, e))
        }
        Err(e) => Err(LocalIoError::new("archive", from, e)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fieldrelay-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write files one after another so creation order matches argument order.
    pub(crate) fn enqueue(dir: &Path, files: &[(&str, &[u8])]) {
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    pub(crate) fn remaining(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn snapshot_is_creation_ordered() {
        let dir = scratch_dir("queue");
        enqueue(&dir, &[("c", b"3"), ("a", b"1"), ("b", b"2")]);
        std::fs::create_dir(dir.join("subdir")).unwrap();
        let queue = OutboundQueue::new(&dir, None);
        let names: Vec<String> = queue
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, ["c", "a", "b"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn complete_deletes_by_default() {
        let dir = scratch_dir("queue");
        enqueue(&dir, &[("a", b"1")]);
        let queue = OutboundQueue::new(&dir, None);
        let files = queue.snapshot().await.unwrap();
        assert_eq!(queue.read(&files[0]).await.unwrap(), b"1");
        queue.complete(&files[0]).await.unwrap();
        assert!(remaining(&dir).is_empty());
        assert!(queue.complete(&files[0]).await.unwrap_err().is_not_found());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn complete_archives_when_configured() {
        let dir = scratch_dir("queue");
        let sent = dir.join("sent");
        let queue = OutboundQueue::new(dir.join("out"), Some(sent.clone()));
        queue.ensure_dirs().await.unwrap();
        enqueue(queue.dir(), &[("a.pcap", b"1")]);
        let files = queue.snapshot().await.unwrap();
        queue.complete(&files[0]).await.unwrap();
        assert!(remaining(queue.dir()).is_empty());
        assert_eq!(remaining(&sent), ["a.pcap"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn failed_archive_marks_file_delivered_until_it_succeeds() {
        let dir = scratch_dir("queue");
        let sent = dir.join("sent");
        let queue = OutboundQueue::new(dir.join("out"), Some(sent.clone()));
        tokio::fs::create_dir_all(queue.dir()).await.unwrap();
        enqueue(queue.dir(), &[("a.pcap", b"1")]);
        let files = queue.snapshot().await.unwrap();

        assert!(!queue.is_delivered(&files[0]));
        queue.complete(&files[0]).await.unwrap_err();
        assert!(queue.is_delivered(&files[0]));
        assert_eq!(remaining(queue.dir()), ["a.pcap"]);

        std::fs::create_dir(&sent).unwrap();
        queue.complete(&files[0]).await.unwrap();
        assert!(!queue.is_delivered(&files[0]));
        assert_eq!(remaining(&sent), ["a.pcap"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn archive_across_filesystems_copies() {
        use std::os::unix::fs::MetadataExt;
        let shm = Path::new("/dev/shm");
        let dir = scratch_dir("queue");
        let on_same_device = match std::fs::metadata(shm) {
            Ok(m) => m.dev() == std::fs::metadata(&dir).unwrap().dev(),
            Err(_) => true,
        };
        if on_same_device {
            std::fs::remove_dir_all(&dir).unwrap();
            return;
        }
        let sent = shm.join(format!("fieldrelay-sent-{}", uuid::Uuid::new_v4()));
        let queue = OutboundQueue::new(&dir, Some(sent.clone()));
        queue.ensure_dirs().await.unwrap();
        enqueue(&dir, &[("a.pcap", b"AAA")]);
        let files = queue.snapshot().await.unwrap();
        queue.complete(&files[0]).await.unwrap();
        assert!(remaining(&dir).is_empty());
        assert_eq!(std::fs::read(sent.join("a.pcap")).unwrap(), b"AAA");
        assert!(!queue.is_delivered(&files[0]));
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::remove_dir_all(&sent).unwrap();
    }

    #[tokio::test]
    async fn missing_directory_is_local_error() {
        let queue = OutboundQueue::new("/nonexistent/fieldrelay/queue", None);
        let err = queue.snapshot().await.unwrap_err();
        assert!(err.is_not_found());
    }
}
