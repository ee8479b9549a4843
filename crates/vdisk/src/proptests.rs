use std::sync::{Arc, Mutex};

use crate::vmdk::{SparseExtentEncoder, VmfsSparseEncoder, VmfsSparseStream};
use crate::{
    lock, read_fully_at, read_to_end, shared, write_fully_at, BackendStream, DifferencingDisk,
    DiskError, MemBackend, RawDisk, Result, SeekOrigin, Stream, StreamBuilder, SubStream,
    VirtualDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
}

#[derive(Debug, Clone)]
enum CursorOp {
    Seek { offset: i64, origin: SeekOrigin },
    SetPosition(u64),
    Read(usize),
    Write(Vec<u8>),
}

const MAX_DISK_SIZE: u32 = 256 * 1024; // 256 KiB
const MAX_OPS: usize = 64;
const MAX_RW_LEN: usize = 8 * 1024;

const SECTOR_SIZE_U32: u32 = SECTOR_SIZE as u32;
const MAX_DISK_SECTORS: u32 = MAX_DISK_SIZE / SECTOR_SIZE_U32;

fn disk_size_strategy() -> impl Strategy<Value = u32> {
    (1u32..=MAX_DISK_SECTORS).prop_map(|sectors| sectors * SECTOR_SIZE_U32)
}

fn overlay_block_size_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(512u32),
        Just(1024u32),
        Just(4096u32),
        Just(16 * 1024u32),
    ]
}

fn offset_strategy(disk_size: u32) -> BoxedStrategy<u32> {
    let max_offset = disk_size;

    let any = 0u32..=max_offset;
    let sector_aligned =
        (0u32..=max_offset / SECTOR_SIZE_U32).prop_map(|lba| lba * SECTOR_SIZE_U32);
    let near_end =
        (0u32..=SECTOR_SIZE_U32).prop_map(move |delta| max_offset.saturating_sub(delta));

    prop_oneof![
        4 => any,
        2 => sector_aligned,
        1 => near_end,
    ]
    .boxed()
}

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    let write = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data });
    let read = offset_strategy(disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), 0usize..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len });

    prop_oneof![
        5 => write,
        4 => read,
        1 => Just(Op::Flush),
    ]
    .boxed()
}

fn cow_scenario_strategy() -> BoxedStrategy<(u32, u32, u8, Vec<Op>)> {
    (disk_size_strategy(), overlay_block_size_strategy(), any::<u8>())
        .prop_flat_map(|(disk_size, block_size, seed)| {
            (
                Just(disk_size),
                Just(block_size),
                Just(seed),
                prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS),
            )
        })
        .boxed()
}

fn cursor_op_strategy(window: u64) -> BoxedStrategy<CursorOp> {
    let span = window as i64 + 16;
    let origin = prop_oneof![
        Just(SeekOrigin::Start),
        Just(SeekOrigin::Current),
        Just(SeekOrigin::End),
    ];
    prop_oneof![
        3 => (-span..=span, origin).prop_map(|(offset, origin)| CursorOp::Seek { offset, origin }),
        2 => (0..=window + 8).prop_map(CursorOp::SetPosition),
        3 => (0usize..=64).prop_map(CursorOp::Read),
        3 => prop::collection::vec(any::<u8>(), 0..=64).prop_map(CursorOp::Write),
    ]
    .boxed()
}

fn window_scenario_strategy() -> BoxedStrategy<(u64, u64, u64, Vec<CursorOp>)> {
    (0u64..256, 0u64..256, 0u64..64)
        .prop_flat_map(|(first, length, slack)| {
            (
                Just(first),
                Just(length),
                Just(slack),
                prop::collection::vec(cursor_op_strategy(length), 1..=MAX_OPS),
            )
        })
        .boxed()
}

/// Sparse content: mostly zero, with a few non-zero runs.
fn sparse_content_strategy() -> BoxedStrategy<(Vec<u8>, u32)> {
    (1usize..=64, prop_oneof![Just(1u32), Just(2u32), Just(8u32)])
        .prop_flat_map(|(sectors, grain_sectors)| {
            let len = sectors * SECTOR_SIZE;
            (
                Just(len),
                Just(grain_sectors),
                prop::collection::vec((0..len, 1usize..=600, any::<u8>()), 0..8),
            )
        })
        .prop_map(|(len, grain_sectors, runs)| {
            let mut data = vec![0u8; len];
            for (start, run, value) in runs {
                let end = (start + run).min(len);
                data[start..end].fill(value);
            }
            (data, grain_sectors)
        })
        .boxed()
}

/// Parent stream that records every range it is asked to read or write.
struct Recording {
    inner: BackendStream<MemBackend>,
    accesses: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl Recording {
    fn record(&self, len: usize) {
        let start = self.inner.position();
        self.accesses
            .lock()
            .unwrap()
            .push((start, start + len as u64));
    }
}

impl Stream for Recording {
    fn can_read(&self) -> bool {
        true
    }
    fn can_write(&self) -> bool {
        true
    }
    fn can_seek(&self) -> bool {
        true
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
        self.record(buf.len());
        self.inner.read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.record(buf.len());
        self.inner.write(buf)
    }
    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

fn run_ops(disk: &dyn VirtualDisk, mut model: Vec<u8>, ops: &[Op]) -> TestCaseResult {
    let content = disk.content();
    let capacity = disk.capacity().unwrap() as usize;
    prop_assert_eq!(capacity, model.len());

    for op in ops {
        match op {
            Op::Write { offset, data } => {
                let offset = *offset as usize;
                write_fully_at(&content, offset as u64, data).unwrap();
                model[offset..offset + data.len()].copy_from_slice(data);

                // Read-after-write must match what we wrote.
                let mut read_back = vec![0xA5u8; data.len()];
                read_fully_at(&content, offset as u64, &mut read_back).unwrap();
                prop_assert_eq!(read_back.as_slice(), data.as_slice());
            }
            Op::Read { offset, len } => {
                let offset = *offset as usize;
                let mut buf = vec![0xA5u8; *len];
                read_fully_at(&content, offset as u64, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &model[offset..offset + len]);
            }
            Op::Flush => {
                lock(&content).flush().unwrap();
            }
        }
    }

    let mut all = vec![0u8; capacity];
    read_fully_at(&content, 0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model.as_slice());

    Ok(())
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_differencing_disk_matches_reference((disk_size, block_size, seed, ops) in cow_scenario_strategy()) {
        let base_data = make_base_pattern(disk_size as usize, seed);
        let base_content = shared(BackendStream::new(MemBackend::from_vec(base_data.clone())));
        let base = RawDisk::new(base_content.clone()).unwrap();
        let disk = DifferencingDisk::in_memory(Box::new(base), block_size).unwrap();

        run_ops(&disk, base_data.clone(), &ops)?;

        // The parent never sees a write.
        let mut parent_now = vec![0u8; disk_size as usize];
        read_fully_at(&base_content, 0, &mut parent_now).unwrap();
        prop_assert_eq!(parent_now, base_data);
    }

    #[test]
    fn prop_substream_never_touches_parent_outside_window((first, length, slack, ops) in window_scenario_strategy()) {
        let accesses = Arc::new(Mutex::new(Vec::new()));
        let parent_len = first + length + slack;
        let parent = shared(Recording {
            inner: BackendStream::new(MemBackend::from_vec(vec![0u8; parent_len as usize])),
            accesses: Arc::clone(&accesses),
        });
        let mut sub = SubStream::new(parent, first, length).unwrap();
        let mut model = vec![0u8; length as usize];

        for op in &ops {
            let before = sub.position();
            match op {
                CursorOp::Seek { offset, origin } => {
                    let base = match origin {
                        SeekOrigin::Start => 0i64,
                        SeekOrigin::Current => before as i64,
                        SeekOrigin::End => length as i64,
                    };
                    match sub.seek(*offset, *origin) {
                        Ok(pos) => prop_assert_eq!(pos as i64, base + offset),
                        Err(err) => {
                            prop_assert!(base + offset < 0);
                            prop_assert!(matches!(err, DiskError::OutOfRange(_)));
                            prop_assert_eq!(sub.position(), before);
                        }
                    }
                }
                CursorOp::SetPosition(pos) => {
                    let result = sub.set_position(*pos);
                    prop_assert_eq!(result.is_ok(), *pos <= length);
                }
                CursorOp::Read(len) => {
                    let mut buf = vec![0u8; *len];
                    let n = sub.read(&mut buf).unwrap();
                    let expected = length.saturating_sub(before).min(*len as u64) as usize;
                    prop_assert_eq!(n, expected);
                    let start = before.min(length) as usize;
                    prop_assert_eq!(&buf[..n], &model[start..start + n]);
                }
                CursorOp::Write(data) => {
                    let fits = before + data.len() as u64 <= length;
                    match sub.write(data) {
                        Ok(()) => {
                            prop_assert!(fits);
                            let start = before as usize;
                            model[start..start + data.len()].copy_from_slice(data);
                            prop_assert_eq!(sub.position(), before + data.len() as u64);
                        }
                        Err(err) => {
                            prop_assert!(!fits);
                            prop_assert!(matches!(err, DiskError::OutOfRange(_)));
                            prop_assert_eq!(sub.position(), before);
                        }
                    }
                }
            }
            prop_assert!(sub.can_read() && sub.can_write() && sub.can_seek());
        }

        for &(start, end) in accesses.lock().unwrap().iter() {
            prop_assert!(start >= first && end <= first + length, "access {}..{}", start, end);
        }
    }

    #[test]
    fn prop_sparse_extent_reads_back_its_content((data, grain_sectors) in sparse_content_strategy()) {
        let len = data.len() as u64;
        let content = shared(BackendStream::new(MemBackend::from_vec(data.clone())));
        let builder = VmfsSparseEncoder::with_grain_sectors(grain_sectors)
            .unwrap()
            .extent_builder(content, len)
            .unwrap();
        let mut encoded = builder.build().unwrap();
        let file = read_to_end(encoded.as_mut(), u64::MAX).unwrap();

        let mut decoded = VmfsSparseStream::open(
            Box::new(BackendStream::read_only(MemBackend::from_vec(file))),
            None,
        )
        .unwrap();
        prop_assert_eq!(decoded.len().unwrap(), len);
        prop_assert_eq!(read_to_end(&mut decoded, u64::MAX).unwrap(), data);
    }
}
