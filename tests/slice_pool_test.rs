use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use iris_indexer::pool::{
    BYTE_BLOCK_SIZE, ByteBlockPool, ByteSliceReader, ByteSliceWriter, TrackingAllocator,
};
use iris_indexer::util::counter::Counter;
use iris_indexer::util::varint::{ByteSink, read_vu32, write_vu32};

#[test]
fn test_hundred_kilobyte_slice_round_trip() -> iris_indexer::Result<()> {
    let counter = Counter::new();
    let mut pool = ByteBlockPool::new(Box::new(TrackingAllocator::new(
        BYTE_BLOCK_SIZE,
        counter.clone(),
    )));
    let data: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 31 % 256) as u8).collect();

    // 1. One slice grows across several blocks
    let start = pool.new_slice(0)?;
    let mut writer = ByteSliceWriter::new(&mut pool, start);
    writer.write_bytes(&data)?;
    let end = writer.address();
    assert!(counter.get() as usize >= 4 * BYTE_BLOCK_SIZE);

    // 2. Read it back in one go
    let mut reader = ByteSliceReader::new(&pool, start, end)?;
    let mut out = Vec::with_capacity(data.len());
    assert_eq!(reader.write_to(&mut out)?, data.len());
    assert_eq!(out, data);
    assert!(reader.eof());

    // 3. Reset gives every block back
    pool.reset(true, false);
    assert_eq!(counter.get(), 0);
    Ok(())
}

#[test]
fn test_interleaved_varint_streams() -> iris_indexer::Result<()> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut pool = ByteBlockPool::default();
    let streams = 64;

    let starts: Vec<usize> = (0..streams)
        .map(|_| pool.new_slice(0))
        .collect::<iris_indexer::Result<_>>()?;
    let mut ends = starts.clone();
    let mut expected: Vec<Vec<u32>> = vec![Vec::new(); streams];

    // 1. Random appends to random streams
    for _ in 0..20_000 {
        let stream = rng.random_range(0..streams);
        let value = match rng.random_range(0..3) {
            0 => rng.random_range(0..128),
            1 => rng.random_range(128..1 << 21),
            _ => rng.random::<u32>(),
        };
        let mut writer = ByteSliceWriter::new(&mut pool, ends[stream]);
        write_vu32(&mut writer, value)?;
        ends[stream] = writer.address();
        expected[stream].push(value);
    }

    // 2. Every stream reads back exactly what went in
    for stream in 0..streams {
        let mut reader = ByteSliceReader::new(&pool, starts[stream], ends[stream])?;
        let mut values = Vec::with_capacity(expected[stream].len());
        while !reader.eof() {
            values.push(read_vu32(&mut reader)?);
        }
        assert_eq!(values, expected[stream], "stream {stream}");
    }
    Ok(())
}
