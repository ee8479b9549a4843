use crate::stream::{lock, resolve_seek, seek_base};
use crate::{DiskError, Result, SeekOrigin, SharedStream, Stream};

enum Parent {
    /// Released together with the view.
    Owned(Box<dyn Stream>),
    /// Outlives the view; dropping the view only drops this handle.
    Shared(SharedStream),
}

/// A window `[first, first + length)` over a parent stream.
///
/// Every transfer repositions the parent to `first + position` first, so several views may share
/// one parent as long as their calls are not interleaved from different threads.
///
/// Reads are clamped to the window. Writes are not: a write that would cross the end of the
/// window is rejected in full before the parent is touched. Likewise [`Stream::seek`] may move
/// past the end of the window, while [`Stream::set_position`] refuses to.
pub struct SubStream {
    parent: Parent,
    first: u64,
    length: u64,
    position: u64,
    can_read: bool,
    can_write: bool,
    can_seek: bool,
}

impl SubStream {
    /// Creates a view that borrows `parent`; the caller stays responsible for releasing it.
    pub fn new(parent: SharedStream, first: u64, length: u64) -> Result<Self> {
        check_window(first, length)?;
        let (can_read, can_write, can_seek) = {
            let guard = lock(&parent);
            (guard.can_read(), guard.can_write(), guard.can_seek())
        };
        Ok(Self {
            parent: Parent::Shared(parent),
            first,
            length,
            position: 0,
            can_read,
            can_write,
            can_seek,
        })
    }

    /// Creates a view that owns `parent` and releases it when the view is dropped.
    pub fn owning(parent: Box<dyn Stream>, first: u64, length: u64) -> Result<Self> {
        check_window(first, length)?;
        Ok(Self {
            can_read: parent.can_read(),
            can_write: parent.can_write(),
            can_seek: parent.can_seek(),
            parent: Parent::Owned(parent),
            first,
            length,
            position: 0,
        })
    }

    pub fn owns_parent(&self) -> bool {
        matches!(self.parent, Parent::Owned(_))
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    fn with_parent<T>(&mut self, f: impl FnOnce(&mut dyn Stream) -> Result<T>) -> Result<T> {
        match &mut self.parent {
            Parent::Owned(parent) => f(parent.as_mut()),
            Parent::Shared(parent) => {
                let mut guard = lock(parent);
                f(&mut *guard)
            }
        }
    }
}

fn check_window(first: u64, length: u64) -> Result<()> {
    first
        .checked_add(length)
        .map(|_| ())
        .ok_or(DiskError::OffsetOverflow)
}

impl Stream for SubStream {
    fn can_read(&self) -> bool {
        self.can_read
    }

    fn can_write(&self) -> bool {
        self.can_write
    }

    fn can_seek(&self) -> bool {
        self.can_seek
    }

    fn len(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        if position > self.length {
            return Err(DiskError::OutOfRange("attempt to move beyond end of stream"));
        }
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let base = seek_base(origin, self.position, self.length);
        self.position = resolve_seek(offset, base)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.length.saturating_sub(self.position);
        let count = available.min(buf.len() as u64) as usize;
        if count == 0 {
            return Ok(0);
        }

        let abs = self.first + self.position;
        let n = self.with_parent(|parent| {
            parent.set_position(abs)?;
            parent.read(&mut buf[..count])
        })?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let end = self
            .position
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OutOfRange("attempt to write beyond end of substream"))?;
        if end > self.length {
            return Err(DiskError::OutOfRange("attempt to write beyond end of substream"));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let abs = self.first + self.position;
        self.with_parent(|parent| {
            parent.set_position(abs)?;
            parent.write(buf)
        })?;
        self.position = end;
        Ok(())
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::NotSupported(
            "attempt to change length of a substream".into(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        self.with_parent(|parent| parent.flush())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::{shared, BackendStream, MemBackend};

    struct DropCounter {
        inner: BackendStream<MemBackend>,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Stream for DropCounter {
        fn can_read(&self) -> bool {
            self.inner.can_read()
        }
        fn can_write(&self) -> bool {
            self.inner.can_write()
        }
        fn can_seek(&self) -> bool {
            self.inner.can_seek()
        }
        fn len(&self) -> Result<u64> {
            self.inner.len()
        }
        fn position(&self) -> u64 {
            self.inner.position()
        }
        fn set_position(&mut self, position: u64) -> Result<()> {
            self.inner.set_position(position)
        }
        fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
            self.inner.seek(offset, origin)
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.inner.read(buf)
        }
        fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.inner.write(buf)
        }
        fn set_len(&mut self, len: u64) -> Result<()> {
            self.inner.set_len(len)
        }
        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn counted(drops: &Arc<AtomicUsize>) -> DropCounter {
        DropCounter {
            inner: BackendStream::new(MemBackend::with_len(256).unwrap()),
            drops: Arc::clone(drops),
        }
    }

    fn window_over_pattern(first: u64, length: u64) -> (SharedStream, SubStream) {
        let parent = shared(BackendStream::new(MemBackend::from_vec(
            (0..=255u8).collect(),
        )));
        let sub = SubStream::new(Arc::clone(&parent), first, length).unwrap();
        (parent, sub)
    }

    #[test]
    fn reads_are_translated_and_clamped_to_the_window() {
        let (_parent, mut sub) = window_over_pattern(100, 10);
        let mut buf = [0u8; 16];
        assert_eq!(sub.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], &[100, 101, 102, 103, 104, 105, 106, 107, 108, 109]);
        assert_eq!(sub.position(), 10);
        assert_eq!(sub.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_of_exactly_the_remaining_bytes_succeeds() {
        let (parent, mut sub) = window_over_pattern(8, 8);
        sub.set_position(5).unwrap();
        sub.write(&[0xaa; 3]).unwrap();
        assert_eq!(sub.position(), 8);

        let mut check = [0u8; 4];
        crate::read_fully_at(&parent, 12, &mut check).unwrap();
        assert_eq!(check, [12, 0xaa, 0xaa, 0xaa]);
    }

    #[test]
    fn write_crossing_the_window_is_rejected_without_touching_parent() {
        let (parent, mut sub) = window_over_pattern(8, 8);
        sub.set_position(5).unwrap();
        let err = sub.write(&[0xaa; 4]).unwrap_err();
        assert!(matches!(err, DiskError::OutOfRange(_)));
        assert_eq!(sub.position(), 5);

        let mut check = [0u8; 4];
        crate::read_fully_at(&parent, 13, &mut check).unwrap();
        assert_eq!(check, [13, 14, 15, 16]);
    }

    #[test]
    fn seek_and_set_position_have_different_bounds() {
        let (_parent, mut sub) = window_over_pattern(0, 100);

        let err = sub.seek(-5, SeekOrigin::Current).unwrap_err();
        assert!(matches!(err, DiskError::OutOfRange(_)));
        assert_eq!(sub.position(), 0);

        assert_eq!(sub.seek(0, SeekOrigin::End).unwrap(), 100);
        let err = sub.write(&[1]).unwrap_err();
        assert!(matches!(err, DiskError::OutOfRange(_)));

        assert_eq!(sub.seek(20, SeekOrigin::End).unwrap(), 120);
        let mut buf = [0u8; 4];
        assert_eq!(sub.read(&mut buf).unwrap(), 0);

        let err = sub.set_position(101).unwrap_err();
        assert!(matches!(err, DiskError::OutOfRange(_)));
        assert_eq!(sub.position(), 120);
        sub.set_position(100).unwrap();
    }

    #[test]
    fn set_len_always_fails() {
        let (_parent, mut sub) = window_over_pattern(0, 100);
        assert!(matches!(
            sub.set_len(50).unwrap_err(),
            DiskError::NotSupported(_)
        ));
        assert_eq!(sub.len().unwrap(), 100);
    }

    #[test]
    fn capabilities_follow_the_parent() {
        let parent = shared(BackendStream::read_only(MemBackend::with_len(64).unwrap()));
        let sub = SubStream::new(parent, 0, 64).unwrap();
        assert!(sub.can_read());
        assert!(!sub.can_write());
        assert!(sub.can_seek());
    }

    #[test]
    fn owning_view_releases_parent_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let sub = SubStream::owning(Box::new(counted(&drops)), 16, 32).unwrap();
        assert!(sub.owns_parent());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(sub);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn borrowing_view_leaves_parent_alive() {
        let drops = Arc::new(AtomicUsize::new(0));
        let parent = shared(counted(&drops));
        let sub = SubStream::new(Arc::clone(&parent), 16, 32).unwrap();
        assert!(!sub.owns_parent());
        drop(sub);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        lock(&parent).set_position(3).unwrap();
        drop(parent);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_windows_compose_offsets() {
        let (_parent, outer) = window_over_pattern(50, 100);
        let mut inner = SubStream::owning(Box::new(outer), 10, 5).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(inner.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[60, 61, 62, 63, 64]);
    }

    #[test]
    fn window_end_overflow_is_rejected() {
        let parent = shared(BackendStream::new(MemBackend::new()));
        assert!(matches!(
            SubStream::new(parent, u64::MAX, 1).err(),
            Some(DiskError::OffsetOverflow)
        ));
    }
}
