//! File-chunk streaming: `FileEntryStreamMessage{path, data, eof}`
//! opens its target path for write on the first chunk (creating
//! parent directories), appends `data`, and closes on `eof=true`.
//! The empty-file edge case — first chunk already carrying `eof=true`
//! with zero-length `data` — still creates the file.

use std::collections::HashMap;
use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::*;
use crate::message::FileEntryStreamMessage;

/// Per-peer set of file streams currently open for write, keyed by
/// the remote path named in the message.
#[derive(Default)]
pub struct FileStreamState {
    open: Mutex<HashMap<String, File>>,
}

impl FileStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one chunk, opening/closing the file as needed.
    pub async fn handle_chunk(&self, msg: &FileEntryStreamMessage) -> Result<()> {
        let mut open = self.open.lock().await;

        if !open.contains_key(&msg.path) {
            if let Some(parent) = Path::new(&msg.path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = File::create(&msg.path).await?;
            open.insert(msg.path.clone(), file);
        }

        if !msg.data.bytes.is_empty() {
            let file = open
                .get_mut(&msg.path)
                .ok_or_else(|| Error::simple(ErrorKind::Subprotocol))?;
            file.write_all(&msg.data.bytes).await?;
        }

        if msg.eof {
            if let Some(mut file) = open.remove(&msg.path) {
                file.flush().await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::spec::BinarySubtype;
    use bson::Binary;

    fn bin(bytes: &[u8]) -> Binary {
        Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_chunks_concatenate_and_close_on_eof() {
        let dir = tempdir();
        let path = dir.join("nested/out.bin");
        let path_str = path.to_str().unwrap().to_string();
        let state = FileStreamState::new();

        state
            .handle_chunk(&FileEntryStreamMessage { path: path_str.clone(), data: bin(b"hello "), eof: false })
            .await
            .unwrap();
        state
            .handle_chunk(&FileEntryStreamMessage { path: path_str.clone(), data: bin(b"world"), eof: true })
            .await
            .unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"hello world");
        assert!(state.open.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_with_eof_on_first_chunk_still_creates_file() {
        let dir = tempdir();
        let path = dir.join("empty.bin");
        let path_str = path.to_str().unwrap().to_string();
        let state = FileStreamState::new();

        state
            .handle_chunk(&FileEntryStreamMessage { path: path_str.clone(), data: bin(b""), eof: true })
            .await
            .unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert!(contents.is_empty());
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("relaylink-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }
}
