//! Backing-file storage for volumes held on this SDS node. One sparse
//! file per volume at `<storage_root>/volumes/vol_<id>.img` (spec.md §6,
//! "Persisted state"). A sidecar `.journal` line records write intent
//! before the data write lands, then a commit marker — the minimal
//! read-after-crash-recovery story implied by spec.md §4.9.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::model::VolumeId;

pub fn volume_path(storage_root: &Path, volume_id: VolumeId) -> PathBuf {
    storage_root.join("volumes").join(format!("vol_{}.img", volume_id.0))
}

fn journal_path(storage_root: &Path, volume_id: VolumeId) -> PathBuf {
    storage_root.join("volumes").join(format!("vol_{}.journal", volume_id.0))
}

/// Creates the backing file (sparse, via `set_len`) if it doesn't exist.
/// Idempotent — safe to call on every `init_volume` frame.
pub async fn ensure_volume_file(storage_root: &Path, volume_id: VolumeId, size_bytes: u64) -> std::io::Result<()> {
    let path = volume_path(storage_root, volume_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path).await?;
    let metadata = file.metadata().await?;
    if metadata.len() < size_bytes {
        file.set_len(size_bytes).await?;
    }
    Ok(())
}

async fn append_journal_line(storage_root: &Path, volume_id: VolumeId, line: &str) -> std::io::Result<()> {
    let path = journal_path(storage_root, volume_id);
    let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

pub async fn read_at(storage_root: &Path, volume_id: VolumeId, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
    let path = volume_path(storage_root, volume_id);
    let mut file = OpenOptions::new().read(true).open(&path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; length as usize];
    let mut filled = 0usize;
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut file, &mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Writes `data` at `offset`, logging PENDING before the write and
/// COMMITTED after the flush lands; a failed write/flush logs ABORTED
/// instead so a crash-recovery reader never finds a dangling PENDING line
/// (spec.md §4.9's write-intent sequence).
pub async fn write_at(storage_root: &Path, volume_id: VolumeId, offset: u64, data: &[u8]) -> std::io::Result<()> {
    append_journal_line(storage_root, volume_id, &format!("PENDING offset={offset} len={}", data.len())).await?;
    let path = volume_path(storage_root, volume_id);
    if let Err(err) = write_and_flush(&path, offset, data).await {
        append_journal_line(storage_root, volume_id, &format!("ABORTED offset={offset} len={}", data.len())).await?;
        return Err(err);
    }
    append_journal_line(storage_root, volume_id, &format!("COMMITTED offset={offset} len={}", data.len())).await?;
    Ok(())
}

async fn write_and_flush(path: &Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("flexsim-backing-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn ensure_volume_file_is_idempotent_and_sparse() {
        let root = temp_root();
        let volume_id = VolumeId(1);
        ensure_volume_file(&root, volume_id, 4096).await.unwrap();
        ensure_volume_file(&root, volume_id, 4096).await.unwrap();

        let metadata = tokio::fs::metadata(volume_path(&root, volume_id)).await.unwrap();
        assert_eq!(metadata.len(), 4096);
    }

    #[tokio::test]
    async fn ensure_volume_file_never_shrinks_on_smaller_request() {
        let root = temp_root();
        let volume_id = VolumeId(1);
        ensure_volume_file(&root, volume_id, 8192).await.unwrap();
        ensure_volume_file(&root, volume_id, 1024).await.unwrap();

        let metadata = tokio::fs::metadata(volume_path(&root, volume_id)).await.unwrap();
        assert_eq!(metadata.len(), 8192);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_bytes_at_offset() {
        let root = temp_root();
        let volume_id = VolumeId(1);
        ensure_volume_file(&root, volume_id, 4096).await.unwrap();

        write_at(&root, volume_id, 100, b"payload").await.unwrap();
        let data = read_at(&root, volume_id, 100, 7).await.unwrap();
        assert_eq!(data, b"payload");
    }

    #[tokio::test]
    async fn write_appends_journal_pending_then_committed() {
        let root = temp_root();
        let volume_id = VolumeId(1);
        ensure_volume_file(&root, volume_id, 4096).await.unwrap();
        write_at(&root, volume_id, 0, b"abc").await.unwrap();

        let journal = tokio::fs::read_to_string(journal_path(&root, volume_id)).await.unwrap();
        let lines: Vec<&str> = journal.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("PENDING"));
        assert!(lines[1].starts_with("COMMITTED"));
    }

    #[tokio::test]
    async fn write_appends_journal_aborted_when_backing_file_is_missing() {
        let root = temp_root();
        let volume_id = VolumeId(1);

        let err = write_at(&root, volume_id, 0, b"abc").await;
        assert!(err.is_err());

        let journal = tokio::fs::read_to_string(journal_path(&root, volume_id)).await.unwrap();
        let lines: Vec<&str> = journal.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("PENDING"));
        assert!(lines[1].starts_with("ABORTED"));
    }
}
