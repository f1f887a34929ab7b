use std::io::Cursor;

use capture_serialiser::{Compression, Serialiser, SerialiserOptions, CHUNK_ALIGNMENT};

fn write_stream(options: SerialiserOptions) -> Serialiser {
    let mut w = Serialiser::writer_with(options);
    {
        let mut rec = w.record("small", 1);
        rec.write("x", &7u8);
        let chunk = rec.finish(false).unwrap();
        assert!(!chunk.is_aligned());
        w.insert_chunk(chunk);
    }
    {
        let mut rec = w.record("texture", 2);
        rec.write("format", &3u8);
        rec.align_next_buffer(16);
        rec.write_buffer("texels", &[0x5A; 300]);
        let chunk = rec.finish(false).unwrap();
        assert!(chunk.is_aligned());
        assert_eq!(chunk.data().as_ptr() as usize % CHUNK_ALIGNMENT, 0);
        w.insert_chunk(chunk);
    }
    w
}

#[test]
fn aligned_chunks_start_on_a_block_boundary() {
    let w = write_stream(SerialiserOptions::default());
    assert!(w.has_aligned_data());
    let stream = w.stream_bytes();
    let texture = w.chunks().nth(1).unwrap();
    let start = stream.len() - texture.len();
    assert_eq!(start % CHUNK_ALIGNMENT, 0);
    assert_eq!(&stream[start..], texture.data());
}

#[test]
fn aligned_buffers_are_aligned_in_memory_when_read() {
    for compression in [Compression::None, Compression::Lz4] {
        let options = SerialiserOptions {
            window_size: 64,
            compression,
            ..SerialiserOptions::default()
        };
        let w = write_stream(options);
        let mut file = Cursor::new(Vec::new());
        w.write_to(&mut file).unwrap();

        let mut r = Serialiser::from_memory_with(file.into_inner(), true, options).unwrap();
        assert_eq!(r.push_record("small", 1).tag, 1);
        assert_eq!(r.read::<u8>("x"), 7);
        r.pop_record();

        // The padding record in front of the texture is skipped transparently.
        assert_eq!(r.push_record("texture", 2).tag, 2);
        assert_eq!(r.read::<u8>("format"), 3);
        r.align_next_buffer(16);
        let texels = r.read_buffer_ref("texels").unwrap();
        assert_eq!(texels.as_ptr() as usize % 16, 0);
        assert_eq!(texels, &[0x5A; 300][..]);
        r.pop_record();
        assert!(r.at_end());
        assert!(!r.has_error());
    }
}

#[test]
fn padding_is_derived_not_stored() {
    let mut w = Serialiser::new_writer();
    w.push_record("rec", 3);
    w.align_next_buffer(8);
    w.write_buffer("b", &[1, 2]);
    w.pop_record();
    let bytes = w.stream_bytes();
    // Header is 6 bytes; 6 bytes of padding put the buffer bytes at offset 16.
    assert_eq!(bytes.len(), 6 + 6 + 4 + 2);
    assert_eq!(&bytes[6..12], &[0; 6]);
    assert_eq!(&bytes[16..], &[1, 2]);
}
