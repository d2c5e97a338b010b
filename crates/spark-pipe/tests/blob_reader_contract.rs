//! `blob_reader_contract` 集成测试：流式写入器与读取视图的对应关系。
//!
//! # 测试目标（Why）
//! - [`BlobWriter`](spark_pipe::BlobWriter) 写出的小端标量、长度前缀文本与行文本
//!   必须能被 [`BlobReader`](spark_pipe::BlobReader) 按相同顺序读回，包括跨越环尾的字段；
//! - 覆盖读取视图的边界语义：到达上限返回 `-1`、跳过被截断、`peek_int` 不移动游标。

#![cfg(not(any(loom, spark_loom)))]

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use spark_pipe::{FieldKind, MessageSchema, Pipe, PipeConfig, PipeRegistry};

const BLOB: i32 = 0;
const PAIR: i32 = 1;

fn pipe(blob_bits: u8) -> Pipe {
    let schema = Arc::new(
        MessageSchema::builder("Blob")
            .message("Blob", [FieldKind::Bytes])
            .message("Pair", [FieldKind::Bytes, FieldKind::Bytes])
            .build()
            .expect("模式"),
    );
    let config = PipeConfig::new(schema, 5, blob_bits)
        .expect("配置")
        .with_constants(Bytes::from_static(b"\x2a\x00\x00\x00tail"));
    let mut pipe = PipeRegistry::new().create(config).expect("创建");
    pipe.init_buffers().expect("分配");
    pipe
}

#[test]
fn streamed_scalars_round_trip_across_the_wrap() {
    let mut pipe = pipe(9);
    pipe.reset_to(0, 506).expect("贴近 512 字节环尾");
    let (mut writer, mut reader) = pipe.split().expect("拆分");

    let size = writer.block_write_message(BLOB).expect("开始消息");
    let mut blob = writer.blob_writer().expect("打开流式写入");
    blob.write_bool(true).expect("bool");
    blob.write_byte(-3).expect("byte");
    blob.write_short(-2).expect("short");
    blob.write_char(0x4E2D).expect("char");
    blob.write_int(0x0102_0304).expect("int");
    blob.write_long(-5).expect("long");
    blob.write_float(1.5).expect("float");
    blob.write_double(-0.25).expect("double");
    blob.write_utf("héllo").expect("utf");
    blob.write_line("第一行").expect("line");
    blob.write_bytes(b"END").expect("bytes");
    let length = blob.finish().expect("提交字段");
    writer.confirm_low_level_write(size);
    writer.publish_writes();
    assert!(!writer.is_in_blob_field_write());

    assert_eq!(reader.take_msg_idx(), BLOB);
    let mut view = reader.blob_reader();
    assert_eq!(view.open_low_level_field(&mut reader), length);
    assert_eq!(view.available(), length as usize);
    assert!(view.read_bool().expect("bool"));
    assert_eq!(view.read_byte().expect("byte"), -3);
    assert_eq!(view.read_unsigned_short().expect("short"), 0xFFFE);
    assert_eq!(view.read_char().expect("char"), 0x4E2D);
    assert_eq!(view.peek_int(0), 0x0102_0304, "peek 不移动游标");
    assert_eq!(view.read_int().expect("int"), 0x0102_0304);
    assert_eq!(view.read_long().expect("long"), -5);
    assert_eq!(view.read_float().expect("float"), 1.5);
    assert_eq!(view.read_double().expect("double"), -0.25);
    assert_eq!(view.read_utf().expect("utf"), "héllo");
    assert_eq!(view.read_line(), "第一行");
    let mut tail = [0u8; 8];
    assert_eq!(view.read_into(&mut tail), 3, "读取被截断到字段上限");
    assert_eq!(&tail[..3], b"END");
    assert!(!view.has_remaining_bytes());
    assert_eq!(view.read_next(), -1);
    assert_eq!(view.read_into(&mut tail), -1);
    assert!(view.read_int().is_err(), "定长读取不会越过上限");

    reader.confirm_low_level_read(size);
    assert_eq!(reader.release_read_lock(), length);
}

#[test]
fn accumulated_fields_read_as_one_stream() {
    let mut pipe = pipe(8);
    let (mut writer, mut reader) = pipe.split().expect("拆分");
    let size = writer.block_write_message(PAIR).expect("开始消息");
    writer.add_byte_array(b"first-").expect("第一段");
    writer.add_byte_array(b"second").expect("第二段");
    writer.confirm_low_level_write(size);
    writer.publish_writes();

    assert_eq!(reader.take_msg_idx(), PAIR);
    let mut view = reader.blob_reader();
    assert_eq!(view.open_low_level_field(&mut reader), 6);
    assert_eq!(view.accum_low_level_field(&mut reader), 6);
    assert_eq!(view.length(), 12);
    assert_eq!(view.skip_bytes(2), 2);
    let mut text = String::new();
    view.read_to_string(&mut text).expect("io::Read");
    assert_eq!(text, "rst-second");
    assert_eq!(view.skip_bytes(5), 0, "跳过不会越过上限");
}

#[test]
fn constants_and_raw_windows_are_readable() {
    let mut pipe = pipe(8);
    let (mut writer, mut reader) = pipe.split().expect("拆分");
    let size = writer.block_write_message(BLOB).expect("开始消息");
    writer.add_constant_reference(0, 8).expect("常量");
    writer.confirm_low_level_write(size);
    writer.publish_writes();

    assert_eq!(reader.take_msg_idx(), BLOB);
    let mut view = reader.blob_reader();
    assert_eq!(view.open_low_level_field(&mut reader), 8);
    assert_eq!(view.read_int().expect("int"), 42);
    let mut rest = String::new();
    assert_eq!(view.read_utf_into(&mut rest, 4), 4);
    assert_eq!(rest, "tail");
    reader.confirm_low_level_read(size);
    reader.release_read_lock();

    let size = writer.block_write_message(BLOB).expect("开始消息");
    writer.add_byte_array(b"raw window").expect("写入");
    writer.confirm_low_level_write(size);
    writer.publish_writes();
    view.open_raw_read(4, 6);
    let mut window = [0u8; 6];
    view.read_fully(&mut window);
    assert_eq!(&window, b"window");
}

#[test]
fn copy_into_writer_moves_bytes_between_pipes() {
    let mut source = pipe(8);
    let mut target = pipe(8);
    let (mut source_writer, mut source_reader) = source.split().expect("拆分");
    let (mut target_writer, mut target_reader) = target.split().expect("拆分");

    let size = source_writer.block_write_message(BLOB).expect("开始消息");
    source_writer.add_byte_array(b"relay this").expect("写入");
    source_writer.confirm_low_level_write(size);
    source_writer.publish_writes();

    assert_eq!(source_reader.take_msg_idx(), BLOB);
    let mut view = source_reader.blob_reader();
    view.open_low_level_field(&mut source_reader);
    let size = target_writer.block_write_message(BLOB).expect("开始消息");
    assert_eq!(view.copy_into_writer(&mut target_writer, 64).expect("复制"), 10);
    target_writer.confirm_low_level_write(size);
    target_writer.publish_writes();

    assert_eq!(target_reader.take_msg_idx(), BLOB);
    let meta = target_reader.take_ring_byte_meta_data();
    let len = target_reader.take_ring_byte_len();
    assert!(target_reader.is_equal_bytes(meta, len, b"relay this"));
}
