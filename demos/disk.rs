//! Drives the disk core against an in-memory storage backend: stage a
//! piece's blocks in the write cache, watch them flush as one vectored
//! write, hash the piece and read a block back from the cache.
//!
//! Run with `cargo run --example disk`.

use std::{path::Path, sync::Arc};

use parking_lot::Mutex;

use bt_disk::{
    blockinfo::BlockInfo,
    disk::{buffer::PoolBuf, Disk},
    error::DiskError,
    iovecs::IoVec,
    storage::{FastresumeStatus, Storage},
    storage_info::StorageInfo,
    PieceIndex, BLOCK_LEN,
};

/// One contiguous in-memory "file" standing in for a real backend.
struct MemStorage {
    piece_len: u32,
    data: Mutex<Vec<u8>>,
}

impl Storage for MemStorage {
    fn readv(
        &self,
        bufs: &mut [PoolBuf],
        piece: PieceIndex,
        offset: u32,
        _flags: u32,
    ) -> Result<usize, DiskError> {
        let data = self.data.lock();
        let mut pos = piece * self.piece_len as usize + offset as usize;
        let mut total = 0;
        for buf in bufs {
            let len = buf.len();
            buf.as_mut_slice().copy_from_slice(&data[pos..pos + len]);
            pos += len;
            total += len;
        }
        Ok(total)
    }

    fn writev(
        &self,
        bufs: &[IoVec],
        piece: PieceIndex,
        offset: u32,
        _flags: u32,
    ) -> Result<usize, DiskError> {
        println!("backend writev: piece {} offset {} ({} buffers)", piece, offset, bufs.len());
        let mut data = self.data.lock();
        let mut pos = piece * self.piece_len as usize + offset as usize;
        let mut total = 0;
        for buf in bufs {
            let src = buf.as_slice();
            data[pos..pos + src.len()].copy_from_slice(src);
            pos += src.len();
            total += src.len();
        }
        Ok(total)
    }

    fn move_storage(&self, _target: &Path) -> Result<(), DiskError> {
        Ok(())
    }

    fn rename_file(&self, _file: usize, _new_name: &str) -> Result<(), DiskError> {
        Ok(())
    }

    fn release_files(&self) -> Result<(), DiskError> {
        Ok(())
    }

    fn delete_files(&self) -> Result<(), DiskError> {
        Ok(())
    }

    fn check_fastresume(
        &self,
        _resume_data: &[u8],
    ) -> Result<FastresumeStatus, DiskError> {
        Ok(FastresumeStatus::Missing)
    }

    fn write_resume_data(&self) -> Result<Vec<u8>, DiskError> {
        Ok(Vec::new())
    }

    fn set_file_priority(&self, _prios: &[u8]) -> Result<(), DiskError> {
        Ok(())
    }

    fn finalize_file(&self, _file: usize) -> Result<(), DiskError> {
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let piece_count = 4;
    let piece_len = 4 * BLOCK_LEN;

    let (disk, mut completions) = Disk::new(BLOCK_LEN as usize);
    let storage = disk.add_torrent(
        Box::new(MemStorage {
            piece_len,
            data: Mutex::new(vec![0; piece_count * piece_len as usize]),
        }),
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_count as u64 * piece_len as u64,
            files: Vec::new(),
        },
    );

    // stage the four blocks of piece 0; the flush engine coalesces them
    // into a single vectored write once the piece digest catches up
    for index in 0..4u32 {
        let block = BlockInfo {
            piece_index: 0,
            offset: index * BLOCK_LEN,
            len: BLOCK_LEN,
        };
        let data = vec![index as u8 + 1; BLOCK_LEN as usize];
        disk.async_write(&storage, block, data, 0, move |job| {
            println!("block {} written: ret {}", index, job.ret);
        });
    }
    disk.submit_jobs();

    disk.async_hash(&storage, 0, 0, |job| {
        println!("piece 0 digest: {:02x?}", job.piece_hash.unwrap());
    });

    disk.async_read(
        &storage,
        BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        },
        0,
        |job| {
            let data = job.buffer.take().unwrap();
            println!(
                "read back block 0: {} bytes, first byte {}",
                data.len(),
                data[0]
            );
        },
    );

    let disk_handle = disk.clone();
    let drain = tokio::spawn(async move {
        while completions.recv().await.is_some() {
            disk_handle.call_job_handlers();
        }
    });

    // let everything settle, then shut the worker pool down
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let info = disk.get_cache_info(Some(&storage), false);
    println!(
        "cache: {} pieces, {} buffers in use, {} blocks written",
        info.stats.num_pieces, info.stats.total_used_buffers, info.stats.blocks_written
    );

    let shutdown_disk = disk.clone();
    tokio::task::spawn_blocking(move || shutdown_disk.shutdown())
        .await
        .unwrap();
    drain.await.unwrap();
}
