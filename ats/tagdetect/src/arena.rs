//! Reusable native image buffer.
//!
//! One region of foreign memory holds the current frame. It only grows:
//! a frame that fits is written in place, a larger one releases the old
//! region and allocates exactly what it needs. Across a run of frames with
//! constant dimensions the allocation count stays at one.

use tagstream::tracing::prefix;
use tracing::{debug, warn};

use crate::binding::BoundFn;
use crate::error::{DetectError, Result};
use crate::native::{NativeModule, NativeValue};
use crate::types::{Frame, NativeHandle};

/// Foreign memory operations the arena needs.
pub trait ArenaAllocator {
    fn allocate(&self, bytes: usize) -> Result<NativeHandle>;
    fn release(&self, handle: NativeHandle) -> Result<()>;
    fn write(&self, handle: NativeHandle, bytes: &[u8]) -> Result<()>;
}

/// Allocator backed by the module's bound `alloc`/`free` exports.
pub struct ModuleAllocator<'a> {
    pub module: &'a dyn NativeModule,
    pub alloc: &'a BoundFn,
    pub free: &'a BoundFn,
}

impl ArenaAllocator for ModuleAllocator<'_> {
    fn allocate(&self, bytes: usize) -> Result<NativeHandle> {
        let handle = self.alloc.call_handle(&[NativeValue::Size(bytes)])?;
        if handle.is_null() {
            return Err(DetectError::Memory(format!(
                "`{}` returned null for {} bytes",
                self.alloc.export(),
                bytes
            )));
        }
        Ok(handle)
    }

    fn release(&self, handle: NativeHandle) -> Result<()> {
        self.free.call_void(&[NativeValue::Handle(handle)])?;
        Ok(())
    }

    fn write(&self, handle: NativeHandle, bytes: &[u8]) -> Result<()> {
        self.module.write_memory(handle, bytes)
    }
}

/// The currently held region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBuffer {
    pub handle: NativeHandle,
    pub capacity_bytes: usize,
}

#[derive(Debug, Default)]
pub struct ImageBufferArena {
    buffer: Option<ArenaBuffer>,
    allocations: usize,
}

impl ImageBufferArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the held region can take `bytes`, growing if needed.
    pub fn ensure(&mut self, allocator: &dyn ArenaAllocator, bytes: usize) -> Result<NativeHandle> {
        if let Some(buffer) = self.buffer {
            if buffer.capacity_bytes >= bytes {
                return Ok(buffer.handle);
            }
            self.buffer = None;
            if let Err(e) = allocator.release(buffer.handle) {
                warn!("{} releasing image buffer {} failed: {}", prefix::CLOSE, buffer.handle, e);
            }
        }

        let handle = allocator.allocate(bytes)?;
        self.allocations += 1;
        debug!(
            "{} image buffer {} ({} bytes, allocation #{})",
            prefix::OPEN,
            handle,
            bytes,
            self.allocations
        );
        self.buffer = Some(ArenaBuffer {
            handle,
            capacity_bytes: bytes,
        });
        Ok(handle)
    }

    /// Copy the frame's luminance bytes to offset 0 of the region.
    pub fn write(&mut self, allocator: &dyn ArenaAllocator, frame: &Frame) -> Result<NativeHandle> {
        let bytes = frame.luminance();
        let handle = self.ensure(allocator, bytes.len())?;
        allocator.write(handle, bytes)?;
        Ok(handle)
    }

    /// Give the region back. Safe to call more than once.
    pub fn release(&mut self, allocator: &dyn ArenaAllocator) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(e) = allocator.release(buffer.handle) {
                warn!("{} releasing image buffer {} failed: {}", prefix::CLOSE, buffer.handle, e);
            }
        }
    }

    pub fn buffer(&self) -> Option<ArenaBuffer> {
        self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.map(|b| b.capacity_bytes).unwrap_or(0)
    }

    /// Regions allocated over the arena's lifetime
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingAllocator {
        log: Mutex<Vec<String>>,
        next: Mutex<usize>,
        fail: bool,
    }

    impl ArenaAllocator for CountingAllocator {
        fn allocate(&self, bytes: usize) -> Result<NativeHandle> {
            if self.fail {
                return Err(DetectError::Memory("out of memory".into()));
            }
            let mut next = self.next.lock();
            *next += 0x100;
            self.log.lock().push(format!("alloc {bytes}"));
            Ok(NativeHandle(*next))
        }

        fn release(&self, handle: NativeHandle) -> Result<()> {
            self.log.lock().push(format!("free {handle}"));
            Ok(())
        }

        fn write(&self, _handle: NativeHandle, bytes: &[u8]) -> Result<()> {
            self.log.lock().push(format!("write {}", bytes.len()));
            Ok(())
        }
    }

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(w, h, vec![0; (w * h) as usize])
    }

    #[test]
    fn test_constant_dimensions_allocate_once() {
        let alloc = CountingAllocator::default();
        let mut arena = ImageBufferArena::new();
        for _ in 0..10 {
            arena.write(&alloc, &frame(64, 48)).unwrap();
        }
        assert_eq!(arena.allocations(), 1);
        assert_eq!(arena.capacity(), 64 * 48);
    }

    #[test]
    fn test_grows_but_never_shrinks() {
        let alloc = CountingAllocator::default();
        let mut arena = ImageBufferArena::new();
        arena.write(&alloc, &frame(10, 10)).unwrap();
        arena.write(&alloc, &frame(20, 20)).unwrap();
        arena.write(&alloc, &frame(5, 5)).unwrap();
        assert_eq!(arena.allocations(), 2);
        assert_eq!(arena.capacity(), 400);

        let log = alloc.log.lock().clone();
        assert_eq!(
            log,
            vec!["alloc 100", "write 100", "free 0x100", "alloc 400", "write 400", "write 25"]
        );
    }

    #[test]
    fn test_failed_allocation_leaves_empty_arena() {
        let alloc = CountingAllocator {
            fail: true,
            ..Default::default()
        };
        let mut arena = ImageBufferArena::new();
        assert!(matches!(
            arena.write(&alloc, &frame(4, 4)),
            Err(DetectError::Memory(_))
        ));
        assert!(arena.buffer().is_none());
        assert_eq!(arena.allocations(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = CountingAllocator::default();
        let mut arena = ImageBufferArena::new();
        arena.write(&alloc, &frame(4, 4)).unwrap();
        arena.release(&alloc);
        arena.release(&alloc);
        assert_eq!(alloc.log.lock().iter().filter(|l| l.starts_with("free")).count(), 1);
    }
}
