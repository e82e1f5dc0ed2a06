//! Append-only durable commit log implementation.

use std::path::{Path, PathBuf};

use crate::protocol::ClientRequest;
use crate::server::ReplicaId;
use crate::utils::ReplogError;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Durable commit log of a replica. One line `"{client} {client_seq}
/// {content}"` per committed client command, in commit order; never
/// rewritten.
pub struct CommitLog {
    /// My replica ID.
    me: ReplicaId,

    /// Path of the backing file.
    path: PathBuf,

    /// File handle opened in append mode.
    backer_file: File,

    /// Whether to `fdatasync()` after each append.
    sync: bool,

    /// Number of lines appended since open.
    appended: usize,
}

impl CommitLog {
    /// Opens (creating if missing) the backing file for appending. Also
    /// creates its parent directory if needed.
    pub async fn new_and_setup(
        me: ReplicaId,
        path: &Path,
        sync: bool,
    ) -> Result<Self, ReplogError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }

        if fs::try_exists(path).await? {
            pf_info!("commit log '{}' already exists", path.display());
        } else {
            pf_info!("created commit log '{}'", path.display());
        }
        let backer_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(CommitLog {
            me,
            path: path.to_path_buf(),
            backer_file,
            sync,
            appended: 0,
        })
    }

    /// Opens an existing log file without write access, so that every
    /// append fails.
    #[cfg(test)]
    pub(crate) async fn new_read_only(
        me: ReplicaId,
        path: &Path,
    ) -> Result<Self, ReplogError> {
        let backer_file = OpenOptions::new().read(true).open(path).await?;
        Ok(CommitLog {
            me,
            path: path.to_path_buf(),
            backer_file,
            sync: false,
            appended: 0,
        })
    }

    /// Appends one committed client command. Returns the number of bytes
    /// written.
    pub async fn append(
        &mut self,
        req: &ClientRequest,
    ) -> Result<usize, ReplogError> {
        let line = format!("{} {} {}\n", req.client, req.client_seq, req.content);
        self.backer_file.write_all(line.as_bytes()).await?;
        self.backer_file.flush().await?;
        if self.sync {
            self.backer_file.sync_data().await?;
        }
        self.appended += 1;
        pf_trace!(
            "replica {} logged line #{} to '{}'",
            self.me,
            self.appended,
            self.path.display()
        );
        Ok(line.len())
    }

    /// Number of lines appended since open.
    #[inline]
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Flushes buffered bytes down to the file.
    pub async fn flush(&mut self) -> Result<(), ReplogError> {
        self.backer_file.flush().await?;
        Ok(())
    }
}

/// Reads all lines of a commit log file. A missing file reads as empty.
pub async fn read_lines(path: &Path) -> Result<Vec<String>, ReplogError> {
    if !fs::try_exists(path).await? {
        return Ok(vec![]);
    }
    let text = fs::read_to_string(path).await?;
    Ok(text.lines().map(String::from).collect())
}

/// Returns true if every log is a prefix of the longest one, i.e., no two
/// replicas committed different content at the same position.
pub fn logs_agree(logs: &[Vec<String>]) -> bool {
    let longest = match logs.iter().max_by_key(|log| log.len()) {
        Some(log) => log,
        None => return true,
    };
    logs.iter()
        .all(|log| log.iter().zip(longest.iter()).all(|(a, b)| a == b))
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    fn req(client: u64, client_seq: u64, content: &str) -> ClientRequest {
        ClientRequest {
            client,
            client_seq,
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn append_and_read() -> Result<(), ReplogError> {
        let path = PathBuf::from("/tmp/replog-test/storage/append.txt");
        let _ = fs::remove_file(&path).await;
        let mut log = CommitLog::new_and_setup(0, &path, true).await?;
        assert_eq!(log.append(&req(0, 1, "hello there.")).await?, 17);
        log.append(&req(2, 1, "general kenobi.")).await?;
        log.flush().await?;
        assert_eq!(log.appended(), 2);
        assert_eq!(
            read_lines(&path).await?,
            vec!["0 1 hello there.", "2 1 general kenobi."]
        );
        Ok(())
    }

    #[tokio::test]
    async fn reopen_appends() -> Result<(), ReplogError> {
        let path = PathBuf::from("/tmp/replog-test/storage/reopen.txt");
        let _ = fs::remove_file(&path).await;
        {
            let mut log = CommitLog::new_and_setup(1, &path, false).await?;
            log.append(&req(0, 1, "a")).await?;
            log.flush().await?;
        }
        let mut log = CommitLog::new_and_setup(1, &path, false).await?;
        log.append(&req(0, 2, "b")).await?;
        log.flush().await?;
        assert_eq!(read_lines(&path).await?, vec!["0 1 a", "0 2 b"]);
        Ok(())
    }

    #[tokio::test]
    async fn append_without_write_access() -> Result<(), ReplogError> {
        let path = PathBuf::from("/tmp/replog-test/storage/readonly.txt");
        let _ = fs::remove_file(&path).await;
        CommitLog::new_and_setup(2, &path, false).await?;
        let mut log = CommitLog::new_read_only(2, &path).await?;
        assert!(log.append(&req(0, 1, "nowhere.")).await.is_err());
        assert_eq!(log.appended(), 0);
        assert!(read_lines(&path).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn read_missing() -> Result<(), ReplogError> {
        let path = PathBuf::from("/tmp/replog-test/storage/missing.txt");
        let _ = fs::remove_file(&path).await;
        assert!(read_lines(&path).await?.is_empty());
        Ok(())
    }

    #[test]
    fn agreement_check() {
        let l = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        assert!(logs_agree(&[]));
        assert!(logs_agree(&[l(&["0 1 a", "0 2 b"]), l(&["0 1 a"]), l(&[])]));
        assert!(!logs_agree(&[l(&["0 1 a", "0 2 b"]), l(&["0 1 a", "0 2 c"])]));
        assert!(!logs_agree(&[l(&["0 2 b"]), l(&["0 1 a", "0 2 b"])]));
    }
}
