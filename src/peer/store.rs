use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::peer::error::StorageError;
use crate::wire::message::Bitfield;

/// Exclusive owner of the shared output file, addressed by piece index.
/// All reads and writes go through one internal lock, so concurrent
/// REQUEST/PIECE handling on different connections cannot interleave on
/// overlapping byte ranges.
#[derive(Debug)]
pub struct PieceStore {
    path: PathBuf,
    file_size: u64,
    piece_size: u64,
    total_pieces: u32,
    file: Mutex<File>,
}

impl PieceStore {
    /// Opens (creating if absent) `dir/<file_name>` for piece-granular
    /// read/write access.
    pub async fn open(
        dir: &Path,
        file_name: &str,
        file_size: u64,
        piece_size: u64,
    ) -> Result<Self, StorageError> {
        let path = dir.join(file_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file_size,
            piece_size,
            total_pieces: file_size.div_ceil(piece_size) as u32,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// Byte length of piece `index`; the last piece holds the file's
    /// remainder.
    pub fn piece_len(&self, index: u32) -> Result<u64, StorageError> {
        if index >= self.total_pieces {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        if index == self.total_pieces - 1 {
            Ok(self.file_size - u64::from(index) * self.piece_size)
        } else {
            Ok(self.piece_size)
        }
    }

    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>, StorageError> {
        let len = self.piece_len(index)?;
        let mut buf = vec![0u8; len as usize];

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(u64::from(index) * self.piece_size))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Writes one complete piece. The data length must match the piece's
    /// exact length; nothing is written otherwise.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let len = self.piece_len(index)?;
        if data.len() as u64 != len {
            return Err(StorageError::WrongPieceLength {
                index,
                expected: len,
                actual: data.len(),
            });
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(u64::from(index) * self.piece_size))
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Whether the file on disk already extends far enough to contain piece
    /// `index` in full.
    pub async fn has_piece_on_disk(&self, index: u32) -> Result<bool, StorageError> {
        let len = self.piece_len(index)?;
        let meta = self.file.lock().await.metadata().await?;
        Ok(meta.len() >= u64::from(index) * self.piece_size + len)
    }

    /// Probes every piece on disk, producing the bitfield to start from.
    /// Pieces are only ever written whole and in ascending offsets within
    /// the file, so file length is an adequate presence test.
    pub async fn probe_bitfield(&self) -> Result<Bitfield, StorageError> {
        let mut bitfield = Bitfield::from_piece_count(self.total_pieces);
        let file_len = self.file.lock().await.metadata().await?.len();
        for index in 0..self.total_pieces {
            let len = self.piece_len(index)?;
            if file_len >= u64::from(index) * self.piece_size + len {
                bitfield.set_piece(index);
            }
        }
        Ok(bitfield)
    }
}
