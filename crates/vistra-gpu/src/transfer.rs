//! Host/device transfer task queue.
//!
//! Producers on any thread build [`TransferTask`]s; a single consumer
//! executes them strictly in FIFO order, which gives read-after-write
//! correctness for overlapping regions without per-task barriers. The
//! immediate (`upload_buffer`, `download_buffer`, ...) and queued
//! (`enqueue_*`) entry points are distinct on purpose: which one blocks is
//! visible at the call site instead of depending on a process-wide mode
//! flag.

use crate::error::{GpuError, Result};
use crate::fifo::Fifo;
use crate::pool::RegionSet;
use crate::texture::TextureHandle;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;

/// Shared destination for a queued download.
///
/// The consumer writes the downloaded bytes into the slot; the producer
/// reads them out after [`TransferQueue::wait_downloads`] returns. This is
/// the owned-memory rendition of the "caller keeps the pointer alive"
/// contract: the slot lives as long as anyone holds a clone.
#[derive(Clone)]
pub struct DownloadSlot {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DownloadSlot {
    /// Create a zeroed slot of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0; size])),
        }
    }

    /// Lock the slot's bytes.
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock()
    }

    /// Copy the slot's bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

/// One host↔device transfer, created by a producer and consumed exactly
/// once by the transfer loop.
pub enum TransferTask {
    /// Copy host bytes into every region of a buffer region set.
    UploadBuffer {
        region: RegionSet,
        offset: u64,
        data: Vec<u8>,
    },
    /// Copy `size` device bytes from the first region into `dest`.
    DownloadBuffer {
        region: RegionSet,
        offset: u64,
        size: u64,
        dest: DownloadSlot,
    },
    /// Copy host bytes into a texture region.
    UploadTexture {
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        data: Vec<u8>,
    },
    /// Copy a texture region into `dest`.
    DownloadTexture {
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        size: u64,
        dest: DownloadSlot,
    },
    /// Device-side copy between two buffer region sets.
    CopyBuffer {
        src: RegionSet,
        src_offset: u64,
        dst: RegionSet,
        dst_offset: u64,
        size: u64,
    },
    /// Device-side copy between two texture regions.
    CopyTexture {
        src: TextureHandle,
        src_offset: [u32; 3],
        dst: TextureHandle,
        dst_offset: [u32; 3],
        shape: [u32; 3],
    },
    /// Sentinel: the consumer finishes the current drain and exits its
    /// loop.
    Stop,
}

impl TransferTask {
    const fn label(&self) -> &'static str {
        match self {
            Self::UploadBuffer { .. } => "upload_buffer",
            Self::DownloadBuffer { .. } => "download_buffer",
            Self::UploadTexture { .. } => "upload_texture",
            Self::DownloadTexture { .. } => "download_texture",
            Self::CopyBuffer { .. } => "copy_buffer",
            Self::CopyTexture { .. } => "copy_texture",
            Self::Stop => "stop",
        }
    }

    const fn is_download(&self) -> bool {
        matches!(
            self,
            Self::DownloadBuffer { .. } | Self::DownloadTexture { .. }
        )
    }
}

/// Executes transfer tasks against a device (or a test double).
///
/// Implementations may assume buffer ranges were validated by the entry
/// points, but must themselves reject stale texture handles and
/// undersized destinations.
pub trait TransferBackend {
    fn upload_buffer(&mut self, region: &RegionSet, offset: u64, data: &[u8]) -> Result<()>;

    fn download_buffer(
        &mut self,
        region: &RegionSet,
        offset: u64,
        size: u64,
        out: &mut [u8],
    ) -> Result<()>;

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        data: &[u8],
    ) -> Result<()>;

    fn download_texture(
        &mut self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        size: u64,
        out: &mut [u8],
    ) -> Result<()>;

    fn copy_buffer(
        &mut self,
        src: &RegionSet,
        src_offset: u64,
        dst: &RegionSet,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;

    fn copy_texture(
        &mut self,
        src: TextureHandle,
        src_offset: [u32; 3],
        dst: TextureHandle,
        dst_offset: [u32; 3],
        shape: [u32; 3],
    ) -> Result<()>;
}

#[derive(Default)]
struct Progress {
    downloads_enqueued: u64,
    downloads_processed: u64,
}

/// Bounded FIFO of transfer tasks plus the loop that drains it.
pub struct TransferQueue {
    fifo: Fifo<TransferTask>,
    progress: Mutex<Progress>,
    progress_cond: Condvar,
}

impl TransferQueue {
    /// Create a queue bounded at `capacity` pending tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            fifo: Fifo::new(capacity),
            progress: Mutex::new(Progress::default()),
            progress_cond: Condvar::new(),
        }
    }

    /// Number of pending tasks.
    pub fn pending(&self) -> usize {
        self.fifo.len()
    }

    // ---- immediate entry points (execute on the calling thread) --------

    /// Upload host bytes into a buffer region, blocking until the device
    /// copy has completed.
    pub fn upload_buffer(
        &self,
        backend: &mut dyn TransferBackend,
        region: &RegionSet,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        region.check_range(offset, data.len() as u64)?;
        backend.upload_buffer(region, offset, data)
    }

    /// Download device bytes from a buffer region into `out`, blocking
    /// until the bytes are on the host.
    pub fn download_buffer(
        &self,
        backend: &mut dyn TransferBackend,
        region: &RegionSet,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        region.check_range(offset, out.len() as u64)?;
        backend.download_buffer(region, offset, out.len() as u64, out)
    }

    /// Device-side copy between buffer regions, blocking until complete.
    pub fn copy_buffer(
        &self,
        backend: &mut dyn TransferBackend,
        src: &RegionSet,
        src_offset: u64,
        dst: &RegionSet,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        check_copy(src, src_offset, dst, dst_offset, size)?;
        backend.copy_buffer(src, src_offset, dst, dst_offset, size)
    }

    /// Upload host bytes into a texture region, blocking until complete.
    pub fn upload_texture(
        &self,
        backend: &mut dyn TransferBackend,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        data: &[u8],
    ) -> Result<()> {
        backend.upload_texture(texture, offset, shape, data)
    }

    /// Download a texture region into `out`, blocking until complete.
    pub fn download_texture(
        &self,
        backend: &mut dyn TransferBackend,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        out: &mut [u8],
    ) -> Result<()> {
        backend.download_texture(texture, offset, shape, out.len() as u64, out)
    }

    /// Device-side texture copy, blocking until complete.
    pub fn copy_texture(
        &self,
        backend: &mut dyn TransferBackend,
        src: TextureHandle,
        src_offset: [u32; 3],
        dst: TextureHandle,
        dst_offset: [u32; 3],
        shape: [u32; 3],
    ) -> Result<()> {
        backend.copy_texture(src, src_offset, dst, dst_offset, shape)
    }

    // ---- queued entry points (return immediately) ----------------------

    /// Queue a buffer upload. Blocks only if the task queue is full.
    pub fn enqueue_upload_buffer(
        &self,
        region: RegionSet,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        region.check_range(offset, data.len() as u64)?;
        self.push(TransferTask::UploadBuffer {
            region,
            offset,
            data,
        });
        Ok(())
    }

    /// Queue a buffer download into `dest`.
    pub fn enqueue_download_buffer(
        &self,
        region: RegionSet,
        offset: u64,
        size: u64,
        dest: DownloadSlot,
    ) -> Result<()> {
        region.check_range(offset, size)?;
        self.push(TransferTask::DownloadBuffer {
            region,
            offset,
            size,
            dest,
        });
        Ok(())
    }

    /// Queue a device-side buffer copy.
    pub fn enqueue_copy_buffer(
        &self,
        src: RegionSet,
        src_offset: u64,
        dst: RegionSet,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        check_copy(&src, src_offset, &dst, dst_offset, size)?;
        self.push(TransferTask::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    /// Queue a texture upload.
    pub fn enqueue_upload_texture(
        &self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        data: Vec<u8>,
    ) {
        self.push(TransferTask::UploadTexture {
            texture,
            offset,
            shape,
            data,
        });
    }

    /// Queue a texture download into `dest`.
    pub fn enqueue_download_texture(
        &self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        size: u64,
        dest: DownloadSlot,
    ) {
        self.push(TransferTask::DownloadTexture {
            texture,
            offset,
            shape,
            size,
            dest,
        });
    }

    /// Queue a device-side texture copy.
    pub fn enqueue_copy_texture(
        &self,
        src: TextureHandle,
        src_offset: [u32; 3],
        dst: TextureHandle,
        dst_offset: [u32; 3],
        shape: [u32; 3],
    ) {
        self.push(TransferTask::CopyTexture {
            src,
            src_offset,
            dst,
            dst_offset,
            shape,
        });
    }

    fn push(&self, task: TransferTask) {
        if task.is_download() {
            self.progress.lock().downloads_enqueued += 1;
        }
        self.fifo.enqueue(task);
    }

    // ---- consumer ------------------------------------------------------

    /// Drain the queue, executing tasks strictly in enqueue order.
    ///
    /// With `block`, waits for tasks and only returns after dequeuing the
    /// [`stop`](Self::stop) sentinel; this is the dedicated-worker mode.
    /// Without it, performs a single drain pass and returns when the queue
    /// is empty.
    ///
    /// A task that fails validation (stale handle, undersized destination)
    /// is logged and skipped; queue bookkeeping stays intact.
    pub fn run(&self, backend: &mut dyn TransferBackend, block: bool) {
        while let Some(task) = self.fifo.dequeue(block) {
            if matches!(task, TransferTask::Stop) {
                tracing::debug!("transfer loop stopping");
                break;
            }

            let label = task.label();
            let is_download = task.is_download();
            if let Err(err) = execute(backend, task) {
                match err {
                    GpuError::Validation(_) | GpuError::ResourceNotFound(_) => {
                        tracing::error!(%err, task = label, "skipping invalid transfer task");
                    }
                    other => {
                        tracing::error!(%other, task = label, "transfer task failed");
                    }
                }
            }

            if is_download {
                let mut progress = self.progress.lock();
                progress.downloads_processed += 1;
                self.progress_cond.notify_all();
            }
        }
    }

    /// Ask a blocking [`run`](Self::run) loop to exit once it reaches the
    /// sentinel.
    pub fn stop(&self) {
        self.fifo.enqueue(TransferTask::Stop);
    }

    /// Block until every download enqueued before this call has been
    /// processed (successfully or skipped), or until `timeout` elapses.
    pub fn wait_downloads(&self, timeout: Duration) -> Result<()> {
        let mut progress = self.progress.lock();
        let target = progress.downloads_enqueued;
        let deadline = std::time::Instant::now() + timeout;

        while progress.downloads_processed < target {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(GpuError::Timeout(format!(
                    "{} download(s) still pending",
                    target - progress.downloads_processed
                )));
            }
            self.progress_cond.wait_for(&mut progress, deadline - now);
        }
        Ok(())
    }
}

fn check_copy(
    src: &RegionSet,
    src_offset: u64,
    dst: &RegionSet,
    dst_offset: u64,
    size: u64,
) -> Result<()> {
    if src.count != dst.count {
        return Err(GpuError::Validation(format!(
            "copy region count mismatch: {} vs {}",
            src.count, dst.count
        )));
    }
    src.check_range(src_offset, size)?;
    dst.check_range(dst_offset, size)
}

fn execute(backend: &mut dyn TransferBackend, task: TransferTask) -> Result<()> {
    match task {
        TransferTask::UploadBuffer {
            region,
            offset,
            data,
        } => backend.upload_buffer(&region, offset, &data),
        TransferTask::DownloadBuffer {
            region,
            offset,
            size,
            dest,
        } => {
            let mut bytes = dest.lock();
            if (bytes.len() as u64) < size {
                return Err(GpuError::Validation(format!(
                    "download destination too small: {} < {size}",
                    bytes.len()
                )));
            }
            backend.download_buffer(&region, offset, size, &mut bytes[..size as usize])
        }
        TransferTask::UploadTexture {
            texture,
            offset,
            shape,
            data,
        } => backend.upload_texture(texture, offset, shape, &data),
        TransferTask::DownloadTexture {
            texture,
            offset,
            shape,
            size,
            dest,
        } => {
            let mut bytes = dest.lock();
            if (bytes.len() as u64) < size {
                return Err(GpuError::Validation(format!(
                    "download destination too small: {} < {size}",
                    bytes.len()
                )));
            }
            backend.download_texture(texture, offset, shape, size, &mut bytes[..size as usize])
        }
        TransferTask::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => backend.copy_buffer(&src, src_offset, &dst, dst_offset, size),
        TransferTask::CopyTexture {
            src,
            src_offset,
            dst,
            dst_offset,
            shape,
        } => backend.copy_texture(src, src_offset, dst, dst_offset, shape),
        TransferTask::Stop => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferKind;
    use std::collections::HashMap;

    /// In-memory backend: one byte vector per buffer kind, grown on
    /// demand the same way the pool grows its device buffers.
    #[derive(Default)]
    struct MemBackend {
        buffers: HashMap<BufferKind, Vec<u8>>,
    }

    impl MemBackend {
        fn bytes(&mut self, kind: BufferKind, end: u64) -> &mut Vec<u8> {
            let buf = self.buffers.entry(kind).or_default();
            if (buf.len() as u64) < end {
                buf.resize(end as usize, 0);
            }
            buf
        }
    }

    impl TransferBackend for MemBackend {
        fn upload_buffer(&mut self, region: &RegionSet, offset: u64, data: &[u8]) -> Result<()> {
            for &base in &region.offsets {
                let start = base + offset;
                let end = start + data.len() as u64;
                let buf = self.bytes(region.kind, end);
                buf[start as usize..end as usize].copy_from_slice(data);
            }
            Ok(())
        }

        fn download_buffer(
            &mut self,
            region: &RegionSet,
            offset: u64,
            size: u64,
            out: &mut [u8],
        ) -> Result<()> {
            let start = region.offsets[0] + offset;
            let buf = self.bytes(region.kind, start + size);
            out.copy_from_slice(&buf[start as usize..(start + size) as usize]);
            Ok(())
        }

        fn upload_texture(
            &mut self,
            _texture: TextureHandle,
            _offset: [u32; 3],
            _shape: [u32; 3],
            _data: &[u8],
        ) -> Result<()> {
            Ok(())
        }

        fn download_texture(
            &mut self,
            _texture: TextureHandle,
            _offset: [u32; 3],
            _shape: [u32; 3],
            _size: u64,
            _out: &mut [u8],
        ) -> Result<()> {
            Ok(())
        }

        fn copy_buffer(
            &mut self,
            src: &RegionSet,
            src_offset: u64,
            dst: &RegionSet,
            dst_offset: u64,
            size: u64,
        ) -> Result<()> {
            for i in 0..src.count as usize {
                let s = src.offsets[i] + src_offset;
                let d = dst.offsets[i] + dst_offset;
                let data =
                    self.bytes(src.kind, s + size)[s as usize..(s + size) as usize].to_vec();
                let buf = self.bytes(dst.kind, d + size);
                buf[d as usize..(d + size) as usize].copy_from_slice(&data);
            }
            Ok(())
        }

        fn copy_texture(
            &mut self,
            _src: TextureHandle,
            _src_offset: [u32; 3],
            _dst: TextureHandle,
            _dst_offset: [u32; 3],
            _shape: [u32; 3],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn region(kind: BufferKind, offset: u64, size: u64) -> RegionSet {
        RegionSet {
            kind,
            count: 1,
            offsets: vec![offset],
            size,
            aligned_size: size,
        }
    }

    #[test]
    fn immediate_round_trip() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let r = region(BufferKind::Vertex, 64, 32);

        queue
            .upload_buffer(&mut backend, &r, 0, &[7_u8; 32])
            .unwrap();

        let mut out = [0_u8; 32];
        queue.download_buffer(&mut backend, &r, 0, &mut out).unwrap();
        assert_eq!(out, [7_u8; 32]);
    }

    #[test]
    fn immediate_rejects_out_of_range() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let r = region(BufferKind::Vertex, 0, 16);

        let err = queue
            .upload_buffer(&mut backend, &r, 8, &[0_u8; 16])
            .unwrap_err();
        assert!(matches!(err, GpuError::Validation(_)));
        // No partial write happened.
        assert!(backend.buffers.is_empty());
    }

    #[test]
    fn queued_round_trip_through_drain() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let r = region(BufferKind::Storage, 0, 16);

        queue
            .enqueue_upload_buffer(r.clone(), 0, vec![12_u8; 16])
            .unwrap();
        let slot = DownloadSlot::new(16);
        queue
            .enqueue_download_buffer(r, 0, 16, slot.clone())
            .unwrap();

        // Single drain pass executes both tasks in order.
        queue.run(&mut backend, false);
        queue.wait_downloads(Duration::from_secs(1)).unwrap();
        assert_eq!(slot.to_vec(), vec![12_u8; 16]);
    }

    #[test]
    fn worker_thread_executes_in_fifo_order() {
        let queue = TransferQueue::new(4);
        let r = region(BufferKind::Index, 0, 4);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut backend = MemBackend::default();
                queue.run(&mut backend, true);
                // Last write wins only if tasks ran in order.
                assert_eq!(backend.buffers[&BufferKind::Index][..4], [3, 3, 3, 3]);
            });

            for value in 0..4_u8 {
                queue
                    .enqueue_upload_buffer(r.clone(), 0, vec![value; 4])
                    .unwrap();
            }
            queue.stop();
        });
    }

    #[test]
    fn copy_moves_bytes_between_kinds() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let src = region(BufferKind::Vertex, 0, 16);
        let dst = region(BufferKind::Storage, 32, 16);

        queue
            .upload_buffer(&mut backend, &src, 0, &[9_u8; 16])
            .unwrap();
        queue
            .copy_buffer(&mut backend, &src, 0, &dst, 0, 16)
            .unwrap();

        let mut out = [0_u8; 16];
        queue
            .download_buffer(&mut backend, &dst, 0, &mut out)
            .unwrap();
        assert_eq!(out, [9_u8; 16]);
    }

    #[test]
    fn copy_count_mismatch_is_validation_error() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let src = region(BufferKind::Vertex, 0, 16);
        let mut dst = region(BufferKind::Storage, 0, 16);
        dst.count = 2;
        dst.offsets = vec![0, 16];

        let err = queue
            .copy_buffer(&mut backend, &src, 0, &dst, 0, 16)
            .unwrap_err();
        assert!(matches!(err, GpuError::Validation(_)));
    }

    #[test]
    fn undersized_download_slot_is_skipped_without_corrupting_queue() {
        let queue = TransferQueue::new(8);
        let mut backend = MemBackend::default();
        let r = region(BufferKind::Vertex, 0, 16);

        queue
            .enqueue_upload_buffer(r.clone(), 0, vec![5_u8; 16])
            .unwrap();
        // Slot smaller than the requested download: skipped, not fatal.
        let bad = DownloadSlot::new(4);
        queue
            .enqueue_download_buffer(r.clone(), 0, 16, bad.clone())
            .unwrap();
        let good = DownloadSlot::new(16);
        queue
            .enqueue_download_buffer(r, 0, 16, good.clone())
            .unwrap();

        queue.run(&mut backend, false);
        queue.wait_downloads(Duration::from_secs(1)).unwrap();

        assert_eq!(bad.to_vec(), vec![0_u8; 4]);
        assert_eq!(good.to_vec(), vec![5_u8; 16]);
    }

    #[test]
    fn wait_downloads_times_out_when_nothing_drains() {
        let queue = TransferQueue::new(8);
        let r = region(BufferKind::Vertex, 0, 16);
        queue
            .enqueue_download_buffer(r, 0, 16, DownloadSlot::new(16))
            .unwrap();

        let err = queue
            .wait_downloads(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, GpuError::Timeout(_)));
    }

    #[test]
    fn wait_downloads_returns_immediately_with_no_pending() {
        let queue = TransferQueue::new(8);
        queue.wait_downloads(Duration::from_millis(1)).unwrap();
    }
}
